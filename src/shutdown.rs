//! Graceful Shutdown Handling
//!
//! Interrupts reach the listener through a watch channel so that a blocked
//! accept or receive wakes up and sees why it was woken. SIGTERM and SIGINT
//! request a shutdown; the run-duration timer requests an expiry, which a
//! repeating listener clears and ignores.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use crate::Result;

/// Why the listener was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// Termination requested; the session ends.
    Shutdown,
    /// The run duration timer fired.
    DurationExpired,
}

/// Shutdown coordinator that fans interrupts out to the listener and workers
#[derive(Clone)]
pub struct ShutdownCoordinator {
    interrupt_tx: Arc<watch::Sender<Option<InterruptReason>>>,
    /// Grace period granted to running flows
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (interrupt_tx, _) = watch::channel(None);
        Self {
            interrupt_tx: Arc::new(interrupt_tx),
            timeout,
        }
    }

    /// Get a signal handle for a component that must react to interrupts
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            tx: Arc::clone(&self.interrupt_tx),
            rx: self.interrupt_tx.subscribe(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Raise an interrupt. A pending shutdown is never downgraded to an expiry.
    pub fn trigger(&self, reason: InterruptReason) {
        self.interrupt_tx.send_modify(|current| {
            if *current != Some(InterruptReason::Shutdown) {
                *current = Some(reason);
            }
        });
        debug!(reason = ?reason, "Interrupt raised");
    }

    /// Request termination.
    pub fn shutdown(&self) {
        self.trigger(InterruptReason::Shutdown);
    }

    /// Report that the run duration elapsed.
    pub fn expire(&self) {
        self.trigger(InterruptReason::DurationExpired);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.interrupt_tx.borrow() == Some(InterruptReason::Shutdown)
    }

    /// Start listening for shutdown signals (SIGTERM, SIGINT)
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.shutdown();
        Ok(())
    }

    /// Raise a duration expiry once `duration` has passed.
    pub fn spawn_duration_timer(&self, duration: Duration) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if coordinator.is_shutting_down() {
                return;
            }
            warn!(duration = ?duration, "Run duration elapsed");
            coordinator.expire();
        })
    }
}

/// Receiving side of the interrupt channel
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<Option<InterruptReason>>>,
    rx: watch::Receiver<Option<InterruptReason>>,
}

impl ShutdownSignal {
    /// Wait for an interrupt that has not been cleared yet.
    pub async fn recv(&mut self) -> InterruptReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Wait for a shutdown only; duration expiries are ignored.
    pub async fn shutdown_requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() == Some(InterruptReason::Shutdown) {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// The interrupt currently raised, if any.
    pub fn pending(&self) -> Option<InterruptReason> {
        *self.rx.borrow()
    }

    /// Acknowledge a duration expiry so the next wait blocks again.
    /// Returns false when a shutdown is pending, which cannot be cleared.
    pub fn clear(&mut self) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == Some(InterruptReason::DurationExpired) {
                *current = None;
                true
            } else {
                false
            }
        });
        self.rx.borrow_and_update().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut first = coordinator.subscribe();
        let mut second = coordinator.subscribe();

        coordinator.shutdown();

        assert_eq!(first.recv().await, InterruptReason::Shutdown);
        assert_eq!(second.recv().await, InterruptReason::Shutdown);
    }

    #[tokio::test]
    async fn test_expiry_does_not_override_shutdown() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let signal = coordinator.subscribe();

        coordinator.shutdown();
        coordinator.expire();

        assert_eq!(signal.pending(), Some(InterruptReason::Shutdown));
    }

    #[tokio::test]
    async fn test_signal_waits_until_raised() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut signal = coordinator.subscribe();

        let waited = tokio::time::timeout(Duration::from_millis(50), signal.recv()).await;
        assert!(waited.is_err());

        let trigger = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.expire();
        });
        assert_eq!(signal.recv().await, InterruptReason::DurationExpired);
    }

    #[tokio::test]
    async fn test_expiry_can_be_cleared_but_shutdown_cannot() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut signal = coordinator.subscribe();

        coordinator.expire();
        assert!(signal.clear());
        assert_eq!(signal.pending(), None);

        coordinator.shutdown();
        assert!(!signal.clear());
        assert_eq!(signal.pending(), Some(InterruptReason::Shutdown));
    }
}
