//! Listener
//!
//! Owns one listening session: binds the endpoint, pulls new flows from the
//! transport's flow source, filters and handshakes them, resolves their group
//! and hands them to the dispatcher. In collapsed datagram mode the whole
//! session runs inside [`CollapsedServer`] instead.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::acceptor::{
    accept_deadline, AcceptOutcome, AcceptedFlow, DatagramDemux, FlowSocket, FlowSource,
    StreamAcceptor,
};
use super::binder::EndpointBinder;
use super::filter::{ClientFilter, FilterDecision, WorkerBudget};
use super::single::CollapsedServer;
use super::worker::{Dispatcher, FlowSettings, FlowWorker};
use crate::config::{Config, Transport};
use crate::error::ListenerError;
use crate::metrics::Metrics;
use crate::protocol::{HandshakeNegotiator, HandshakeOutcome};
use crate::registry::GroupRegistry;
use crate::shutdown::{InterruptReason, ShutdownCoordinator, ShutdownSignal};
use crate::Result;

/// Why a listening session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted(InterruptReason),
    /// No new flow arrived within the run duration.
    DeadlineElapsed,
    /// The configured number of flows has been served.
    BudgetExhausted,
}

enum Session {
    Dispatching(Box<dyn FlowSource>),
    Collapsed(CollapsedServer),
}

/// One listening session
pub struct Listener {
    config: Arc<Config>,
    registry: Arc<GroupRegistry>,
    dispatcher: Arc<Dispatcher>,
    metrics: Option<Arc<Metrics>>,
    shutdown: ShutdownCoordinator,
    worker: Arc<dyn FlowWorker>,
    session: Option<Session>,
}

impl Listener {
    pub fn new(
        config: Arc<Config>,
        worker: Arc<dyn FlowWorker>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self::with_registry(config, worker, shutdown, Arc::new(GroupRegistry::new()))
    }

    /// Use a registry shared with the worker.
    pub fn with_registry(
        config: Arc<Config>,
        worker: Arc<dyn FlowWorker>,
        shutdown: ShutdownCoordinator,
        registry: Arc<GroupRegistry>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&worker),
            Arc::clone(&registry),
            None,
            shutdown.clone(),
        ));
        Self {
            config,
            registry,
            dispatcher,
            metrics: None,
            shutdown,
            worker,
            session: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.worker),
            Arc::clone(&self.registry),
            Some(Arc::clone(&metrics)),
            self.shutdown.clone(),
        ));
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> Arc<GroupRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn active_flows(&self) -> usize {
        self.dispatcher.active_flows()
    }

    /// Bind the listening endpoint and return its address.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let server = &self.config.server;
        let binder = EndpointBinder::new(server.bind_addr, server.transport);
        let deadline = accept_deadline(server);

        let session = match server.transport {
            Transport::Udp if server.single_udp => Session::Collapsed(CollapsedServer::new(
                server,
                binder,
                Arc::clone(&self.registry),
                Arc::clone(&self.dispatcher),
                self.metrics.clone(),
            )?),
            Transport::Udp => Session::Dispatching(Box::new(DatagramDemux::new(
                binder,
                server.buffer_len,
                Arc::clone(&self.registry),
                deadline,
            )?)),
            Transport::Tcp => Session::Dispatching(Box::new(StreamAcceptor::new(binder, deadline)?)),
        };
        self.session = Some(session);

        self.local_addr()
            .ok_or_else(|| anyhow::anyhow!("listening endpoint has no local address"))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.session.as_ref()? {
            Session::Dispatching(source) => source.local_addr(),
            Session::Collapsed(server) => Some(server.local_addr()),
        }
    }

    /// Run the session until it is interrupted, times out or runs out of
    /// budget. An interrupted session gives running flows the shutdown grace
    /// period; otherwise they run to completion unless a shutdown arrives.
    pub async fn run(&mut self) -> Result<StopReason> {
        self.bind()?;
        let mut signal = self.shutdown.subscribe();

        let stopped = match &mut self.session {
            Some(Session::Collapsed(server)) => server.run(&mut signal).await?,
            _ => self.run_dispatching(&mut signal).await?,
        };

        info!(reason = ?stopped, "Listener stopped");
        match stopped {
            StopReason::Interrupted(_) => {
                self.dispatcher.wait_idle(self.shutdown.timeout()).await;
            }
            StopReason::DeadlineElapsed | StopReason::BudgetExhausted => {
                self.dispatcher
                    .wait_drained(&mut signal, self.shutdown.timeout())
                    .await;
            }
        }
        Ok(stopped)
    }

    async fn run_dispatching(&mut self, signal: &mut ShutdownSignal) -> Result<StopReason> {
        let server = self.config.server.clone();
        let mut filter = ClientFilter::new(&server);
        let mut budget = WorkerBudget::new(server.max_flows);
        let negotiator =
            (!server.compat && !server.is_multicast()).then(|| HandshakeNegotiator::new(&server));

        let Some(Session::Dispatching(source)) = self.session.as_mut() else {
            anyhow::bail!("listener is not bound");
        };
        info!(
            transport = %source.transport(),
            local = ?source.local_addr(),
            client = ?filter.allowed(),
            "Accepting flows"
        );

        loop {
            if budget.exhausted() {
                return Ok(StopReason::BudgetExhausted);
            }

            let outcome = match source.next_flow(signal).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "Failed to take next flow");
                    continue;
                }
            };

            let mut flow = match outcome {
                AcceptOutcome::Flow(flow) => flow,
                AcceptOutcome::Interrupted(InterruptReason::DurationExpired)
                    if server.repeat && signal.clear() =>
                {
                    info!("Run duration elapsed, continuing to listen");
                    continue;
                }
                AcceptOutcome::Interrupted(reason) => return Ok(StopReason::Interrupted(reason)),
                AcceptOutcome::DeadlineElapsed => return Ok(StopReason::DeadlineElapsed),
            };
            let peer = flow.peer;

            if filter.on_accept(peer, self.registry.is_empty(), &mut budget) == FilterDecision::Reject {
                warn!(peer = %peer, "Rejected flow from disallowed host");
                if let Some(metrics) = &self.metrics {
                    metrics.record_rejected();
                }
                drop(flow);
                source.rebind()?;
                continue;
            }

            let handshake = match &negotiator {
                Some(negotiator) => match negotiate(negotiator, &mut flow).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Handshake failed, abandoning flow");
                        if let Some(metrics) = &self.metrics {
                            metrics.record_handshake_failure();
                        }
                        drop(flow);
                        source.rebind()?;
                        continue;
                    }
                },
                None => HandshakeOutcome::default(),
            };
            if handshake.acked {
                if let Some(metrics) = &self.metrics {
                    metrics.record_ack();
                }
            }

            let new_group = self.registry.lookup_host(peer.ip()).is_none();
            let group = self.registry.register(peer);
            if new_group {
                if let Some(metrics) = &self.metrics {
                    metrics.record_group_created();
                }
            }
            debug!(peer = %peer, group = %group.id(), "Dispatching flow");

            self.dispatcher
                .dispatch(FlowSettings::snapshot(&server, flow, group, &handshake));
            if let Some(metrics) = &self.metrics {
                metrics.record_accepted();
            }
            if !server.single_client {
                budget.consume();
            }

            source.rebind()?;
        }
    }
}

async fn negotiate(
    negotiator: &HandshakeNegotiator,
    flow: &mut AcceptedFlow,
) -> std::result::Result<HandshakeOutcome, ListenerError> {
    let peer = flow.peer;
    match &mut flow.socket {
        FlowSocket::Stream(stream) => negotiator.negotiate_stream(stream, peer).await,
        FlowSocket::Datagram(socket) => {
            let datagram = flow.first_datagram.as_deref().unwrap_or_default();
            negotiator.negotiate_datagram(socket, datagram, peer).await
        }
    }
}
