//! Worker Dispatcher
//!
//! Every accepted flow gets a settings snapshot and its own task. The task
//! races the worker against a shutdown request and, when the worker is done,
//! drops the flow from the registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::acceptor::{AcceptedFlow, FlowSocket};
use crate::config::{ServerConfig, Transport};
use crate::metrics::Metrics;
use crate::protocol::{ClientHeader, HandshakeOutcome, PeerVersion};
use crate::registry::{GroupHandle, GroupRegistry};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};

/// When a reverse-direction test starts relative to the flow that asked for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Both directions at once
    Dual,
    /// Reverse direction after the flow completes
    Tradeoff,
}

/// How much the reverse-direction client should send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestAmount {
    Bytes(u64),
    Time(Duration),
}

impl TestAmount {
    /// Negative amounts are a duration in hundredths of a second.
    fn from_wire(amount: i32) -> Self {
        if amount < 0 {
            TestAmount::Time(Duration::from_millis(amount.unsigned_abs() as u64 * 10))
        } else {
            TestAmount::Bytes(amount as u64)
        }
    }
}

/// Settings for the reverse-direction client a peer asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub remote: SocketAddr,
    pub transport: Transport,
    pub threads: u32,
    pub buffer_len: usize,
    /// Window size for stream tests, bandwidth for datagram tests
    pub win_band: i32,
    pub amount: TestAmount,
    pub mode: TestMode,
}

impl ClientSettings {
    /// Derive follow-up settings from a version 1 client header.
    pub fn from_header(
        header: &ClientHeader,
        peer: SocketAddr,
        transport: Transport,
        default_buffer_len: usize,
    ) -> Option<Self> {
        let legacy = header.legacy?;
        let port = u16::try_from(legacy.port)
            .ok()
            .filter(|p| *p != 0)
            .unwrap_or(peer.port());

        Some(Self {
            remote: SocketAddr::new(peer.ip(), port),
            transport,
            threads: legacy.num_threads.max(1) as u32,
            buffer_len: usize::try_from(legacy.buffer_len)
                .ok()
                .filter(|len| *len > 0)
                .unwrap_or(default_buffer_len),
            win_band: legacy.win_band,
            amount: TestAmount::from_wire(legacy.amount),
            mode: if header.run_now() {
                TestMode::Dual
            } else {
                TestMode::Tradeoff
            },
        })
    }
}

/// Everything a worker needs to serve one flow
#[derive(Debug)]
pub struct FlowSettings {
    pub flow_id: Uuid,
    pub transport: Transport,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub buffer_len: usize,
    pub report_interval: Option<Duration>,
    pub duration: Option<Duration>,
    pub group: Arc<GroupHandle>,
    pub peer_version: Option<PeerVersion>,
    pub follow_up: Option<ClientSettings>,
    pub socket: FlowSocket,
    /// Datagram the listener consumed while demultiplexing
    pub initial_datagram: Option<Bytes>,
}

impl FlowSettings {
    /// Copy the listener's base settings and attach the flow's own state.
    pub fn snapshot(
        server: &ServerConfig,
        flow: AcceptedFlow,
        group: Arc<GroupHandle>,
        handshake: &HandshakeOutcome,
    ) -> Self {
        let follow_up = handshake.header.as_ref().and_then(|header| {
            ClientSettings::from_header(header, flow.peer, server.transport, server.buffer_len)
        });

        Self {
            flow_id: Uuid::new_v4(),
            transport: server.transport,
            peer: flow.peer,
            local: flow.local,
            buffer_len: server.buffer_len,
            report_interval: server.report_interval,
            duration: server.duration,
            group,
            peer_version: handshake.peer_version(),
            follow_up,
            socket: flow.socket,
            initial_datagram: flow.first_datagram,
        }
    }
}

/// Performs the measurement for one flow
#[async_trait]
pub trait FlowWorker: Send + Sync + 'static {
    /// Serve the flow until the peer is done.
    async fn run(&self, flow: FlowSettings) -> anyhow::Result<()>;

    /// Run a reverse-direction client the peer asked for.
    async fn run_client(&self, client: ClientSettings) -> anyhow::Result<()> {
        warn!(
            remote = %client.remote,
            mode = ?client.mode,
            "Reverse-direction tests are not supported by this worker"
        );
        Ok(())
    }
}

/// Schedules flows onto their own tasks
pub struct Dispatcher {
    worker: Arc<dyn FlowWorker>,
    registry: Arc<GroupRegistry>,
    metrics: Option<Arc<Metrics>>,
    active: Arc<AtomicUsize>,
    shutdown: ShutdownCoordinator,
}

impl Dispatcher {
    pub fn new(
        worker: Arc<dyn FlowWorker>,
        registry: Arc<GroupRegistry>,
        metrics: Option<Arc<Metrics>>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            worker,
            registry,
            metrics,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    /// Number of flows whose worker is still running
    pub fn active_flows(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Hand a flow to its own task.
    pub fn dispatch(&self, flow: FlowSettings) -> JoinHandle<()> {
        let worker = Arc::clone(&self.worker);
        let registry = Arc::clone(&self.registry);
        let metrics = self.metrics.clone();
        let active = Arc::clone(&self.active);
        let mut signal = self.shutdown.subscribe();

        active.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &metrics {
            metrics.flow_started();
        }

        let span = info_span!("flow", flow_id = %flow.flow_id, peer = %flow.peer);
        tokio::spawn(
            async move {
                let peer = flow.peer;
                let group = flow.group.id();
                let started = Instant::now();
                let follow_up = flow.follow_up.clone();

                if let Some(client) = follow_up.clone().filter(|c| c.mode == TestMode::Dual) {
                    let worker = Arc::clone(&worker);
                    tokio::spawn(
                        async move {
                            if let Err(e) = worker.run_client(client).await {
                                error!(error = %e, "Dual-test client failed");
                            }
                        }
                        .in_current_span(),
                    );
                }

                info!(group = %group, "Flow started");
                let completed = tokio::select! {
                    result = worker.run(flow) => {
                        match result {
                            Ok(()) => debug!("Worker finished"),
                            Err(e) => error!(error = %e, "Worker failed"),
                        }
                        true
                    }
                    _ = signal.shutdown_requested() => {
                        info!("Flow received shutdown signal, closing");
                        false
                    }
                };

                registry.remove(peer);
                info!(group = %group, elapsed = ?started.elapsed(), "Flow finished");

                if completed {
                    if let Some(client) = follow_up.filter(|c| c.mode == TestMode::Tradeoff) {
                        if let Err(e) = worker.run_client(client).await {
                            error!(error = %e, "Trade-off client failed");
                        }
                    }
                }

                active.fetch_sub(1, Ordering::Relaxed);
                if let Some(metrics) = &metrics {
                    metrics.flow_finished();
                }
            }
            .instrument(span),
        )
    }

    /// Start a reverse-direction client outside of any flow task.
    pub fn start_client(&self, client: ClientSettings) -> JoinHandle<()> {
        let worker = Arc::clone(&self.worker);
        tokio::spawn(async move {
            if let Err(e) = worker.run_client(client).await {
                error!(error = %e, "Reverse-direction client failed");
            }
        })
    }

    /// Wait for running flows with no time limit. A shutdown arriving
    /// meanwhile falls back to the `grace` bounded wait.
    pub async fn wait_drained(&self, signal: &mut ShutdownSignal, grace: Duration) -> bool {
        if self.active_flows() > 0 {
            info!("Waiting for {} active flows to complete", self.active_flows());
        }

        let drained = async {
            while self.active_flows() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        tokio::select! {
            _ = drained => true,
            _ = signal.shutdown_requested() => self.wait_idle(grace).await,
        }
    }

    /// Wait for running flows to finish, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut last_count = self.active_flows();
        if last_count > 0 {
            info!("Waiting for {} active flows to finish (timeout: {:?})", last_count, timeout);
        }

        while last_count > 0 && start.elapsed() < timeout {
            tokio::time::sleep(Duration::from_millis(50)).await;

            let current_count = self.active_flows();
            if current_count != last_count {
                debug!("Active flows: {} -> {}", last_count, current_count);
                last_count = current_count;
            }
        }

        if last_count == 0 {
            true
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} flows still active",
                start.elapsed(),
                last_count
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LegacyFields, HEADER_VERSION1, RUN_NOW};
    use crate::registry::GroupId;
    use tokio::sync::mpsc;

    fn header(flags: u32, port: i32, amount: i32) -> ClientHeader {
        ClientHeader {
            flags: HEADER_VERSION1 | flags,
            legacy: Some(LegacyFields {
                num_threads: 2,
                port,
                buffer_len: 0,
                win_band: 0,
                amount,
            }),
            version: None,
        }
    }

    #[test]
    fn test_run_now_means_dual_test() {
        let peer: SocketAddr = "10.0.0.9:40000".parse().unwrap();
        let dual = ClientSettings::from_header(&header(RUN_NOW, 5002, -1000), peer, Transport::Tcp, 8192)
            .unwrap();
        assert_eq!(dual.mode, TestMode::Dual);
        assert_eq!(dual.remote, "10.0.0.9:5002".parse::<SocketAddr>().unwrap());
        assert_eq!(dual.amount, TestAmount::Time(Duration::from_secs(10)));
        assert_eq!(dual.buffer_len, 8192);

        let tradeoff = ClientSettings::from_header(&header(0, 5002, 4096), peer, Transport::Tcp, 8192)
            .unwrap();
        assert_eq!(tradeoff.mode, TestMode::Tradeoff);
        assert_eq!(tradeoff.amount, TestAmount::Bytes(4096));
    }

    #[test]
    fn test_no_legacy_fields_no_follow_up() {
        let header = ClientHeader {
            flags: 0,
            legacy: None,
            version: None,
        };
        let peer: SocketAddr = "10.0.0.9:40000".parse().unwrap();
        assert!(ClientSettings::from_header(&header, peer, Transport::Udp, 1470).is_none());
    }

    struct Blocking {
        started: mpsc::UnboundedSender<SocketAddr>,
    }

    #[async_trait]
    impl FlowWorker for Blocking {
        async fn run(&self, flow: FlowSettings) -> anyhow::Result<()> {
            let _ = self.started.send(flow.peer);
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_flows_and_clears_registry() {
        let registry = Arc::new(GroupRegistry::new());
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            Arc::new(Blocking { started: tx }),
            Arc::clone(&registry),
            None,
            coordinator.clone(),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = tokio::net::TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let group = registry.register(peer);
        assert_eq!(group.id(), GroupId(-1));

        let flow = AcceptedFlow {
            peer,
            local: stream.local_addr().unwrap(),
            socket: FlowSocket::Stream(stream),
            first_datagram: None,
        };
        let config = crate::config::Config::default();
        let handle = dispatcher.dispatch(FlowSettings::snapshot(
            &config.server,
            flow,
            group,
            &HandshakeOutcome::default(),
        ));

        assert_eq!(rx.recv().await, Some(peer));
        assert_eq!(dispatcher.active_flows(), 1);

        coordinator.expire();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.active_flows(), 1);

        coordinator.shutdown();
        handle.await.unwrap();
        assert!(dispatcher.wait_idle(Duration::from_secs(1)).await);
        assert!(registry.is_empty());
        drop(client);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        Run,
        RunDone,
        Client(TestMode),
    }

    /// Holds each flow until released and records follow-up clients.
    struct Gated {
        steps: mpsc::UnboundedSender<Step>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl FlowWorker for Gated {
        async fn run(&self, _flow: FlowSettings) -> anyhow::Result<()> {
            let _ = self.steps.send(Step::Run);
            self.release.notified().await;
            let _ = self.steps.send(Step::RunDone);
            Ok(())
        }

        async fn run_client(&self, client: ClientSettings) -> anyhow::Result<()> {
            let _ = self.steps.send(Step::Client(client.mode));
            Ok(())
        }
    }

    struct GatedSetup {
        dispatcher: Dispatcher,
        coordinator: ShutdownCoordinator,
        registry: Arc<GroupRegistry>,
        steps: mpsc::UnboundedReceiver<Step>,
        release: Arc<tokio::sync::Notify>,
    }

    fn gated(grace: Duration) -> GatedSetup {
        let registry = Arc::new(GroupRegistry::new());
        let coordinator = ShutdownCoordinator::new(grace);
        let (tx, steps) = mpsc::unbounded_channel();
        let release = Arc::new(tokio::sync::Notify::new());
        let dispatcher = Dispatcher::new(
            Arc::new(Gated {
                steps: tx,
                release: Arc::clone(&release),
            }),
            Arc::clone(&registry),
            None,
            coordinator.clone(),
        );
        GatedSetup {
            dispatcher,
            coordinator,
            registry,
            steps,
            release,
        }
    }

    /// Dispatch a stream flow whose peer sent `header`. Returns the client
    /// end, which must stay open for the flow's lifetime.
    async fn dispatch_with(
        setup: &GatedSetup,
        header: Option<ClientHeader>,
    ) -> (JoinHandle<()>, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = tokio::net::TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let group = setup.registry.register(peer);

        let flow = AcceptedFlow {
            peer,
            local: stream.local_addr().unwrap(),
            socket: FlowSocket::Stream(stream),
            first_datagram: None,
        };
        let config = crate::config::Config::default();
        let handshake = HandshakeOutcome {
            header,
            acked: false,
        };
        let handle = setup
            .dispatcher
            .dispatch(FlowSettings::snapshot(&config.server, flow, group, &handshake));
        (handle, client)
    }

    async fn next_step(steps: &mut mpsc::UnboundedReceiver<Step>) -> Step {
        tokio::time::timeout(Duration::from_secs(5), steps.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dual_client_runs_alongside_flow() {
        let mut setup = gated(Duration::from_secs(1));
        let (handle, _client) = dispatch_with(&setup, Some(header(RUN_NOW, 5002, 100))).await;

        let mut seen = vec![next_step(&mut setup.steps).await, next_step(&mut setup.steps).await];
        seen.sort_by_key(|step| matches!(step, Step::Client(_)));
        assert_eq!(seen, vec![Step::Run, Step::Client(TestMode::Dual)]);

        setup.release.notify_one();
        assert_eq!(next_step(&mut setup.steps).await, Step::RunDone);
        handle.await.unwrap();
        assert!(setup.steps.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tradeoff_client_waits_for_flow_completion() {
        let mut setup = gated(Duration::from_secs(1));
        let (handle, _client) = dispatch_with(&setup, Some(header(0, 5002, 100))).await;

        assert_eq!(next_step(&mut setup.steps).await, Step::Run);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(setup.steps.try_recv().is_err());

        setup.release.notify_one();
        assert_eq!(next_step(&mut setup.steps).await, Step::RunDone);
        assert_eq!(
            next_step(&mut setup.steps).await,
            Step::Client(TestMode::Tradeoff)
        );
        handle.await.unwrap();
        assert!(setup.registry.is_empty());
    }

    #[tokio::test]
    async fn test_tradeoff_client_skipped_when_flow_is_shut_down() {
        let mut setup = gated(Duration::from_secs(1));
        let (handle, _client) = dispatch_with(&setup, Some(header(0, 5002, 100))).await;

        assert_eq!(next_step(&mut setup.steps).await, Step::Run);
        setup.coordinator.shutdown();
        handle.await.unwrap();

        assert!(setup.steps.try_recv().is_err());
        assert!(setup.registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_drained_outlasts_grace_period() {
        let mut setup = gated(Duration::from_millis(50));
        let (_handle, _client) = dispatch_with(&setup, None).await;
        assert_eq!(next_step(&mut setup.steps).await, Step::Run);

        let release = Arc::clone(&setup.release);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            release.notify_one();
        });

        let mut signal = setup.coordinator.subscribe();
        assert!(
            setup
                .dispatcher
                .wait_drained(&mut signal, setup.coordinator.timeout())
                .await
        );
        assert_eq!(next_step(&mut setup.steps).await, Step::RunDone);
        assert_eq!(setup.dispatcher.active_flows(), 0);
    }

    #[tokio::test]
    async fn test_wait_drained_yields_to_shutdown() {
        let mut setup = gated(Duration::from_secs(1));
        let (_handle, _client) = dispatch_with(&setup, None).await;
        assert_eq!(next_step(&mut setup.steps).await, Step::Run);

        let coordinator = setup.coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            coordinator.shutdown();
        });

        let mut signal = setup.coordinator.subscribe();
        let drained = tokio::time::timeout(
            Duration::from_secs(5),
            setup
                .dispatcher
                .wait_drained(&mut signal, setup.coordinator.timeout()),
        )
        .await
        .unwrap();
        assert!(drained);
        assert!(setup.steps.try_recv().is_err());
    }
}
