//! Collapsed single-context datagram server
//!
//! Every datagram is handled inside the listener task: new senders are
//! filtered, handshaken and registered, mid-flow datagrams are accounted, and
//! termination markers are answered with the flow's summary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::acceptor::accept_deadline;
use super::binder::{BoundSocket, EndpointBinder};
use super::filter::{ClientFilter, FilterDecision, WorkerBudget};
use super::listener::StopReason;
use super::worker::{ClientSettings, Dispatcher, TestMode};
use crate::config::ServerConfig;
use crate::error::ListenerError;
use crate::metrics::Metrics;
use crate::protocol::{DatagramMarker, HandshakeNegotiator, DATAGRAM_HEADER_LEN, MAX_HEADER_LEN};
use crate::registry::{normalize_addr, GroupRegistry};
use crate::report::{prepare_final_reply, FlowReport, PacketSample};
use crate::shutdown::{InterruptReason, ShutdownSignal};

struct ActiveFlow {
    report: FlowReport,
    follow_up: Option<ClientSettings>,
}

/// What to do with one received datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatagramAction {
    Account,
    Start,
    Finish,
    Stray,
}

impl DatagramAction {
    fn classify(marker: &DatagramMarker, registered: bool) -> Self {
        match (marker.is_termination(), registered) {
            (false, true) => DatagramAction::Account,
            (false, false) => DatagramAction::Start,
            (true, true) => DatagramAction::Finish,
            (true, false) => DatagramAction::Stray,
        }
    }
}

/// Single-task datagram server
pub struct CollapsedServer {
    server: ServerConfig,
    socket: UdpSocket,
    local: SocketAddr,
    buf: BytesMut,
    registry: Arc<GroupRegistry>,
    dispatcher: Arc<Dispatcher>,
    metrics: Option<Arc<Metrics>>,
    filter: ClientFilter,
    budget: WorkerBudget,
    negotiator: Option<HandshakeNegotiator>,
    flows: HashMap<SocketAddr, ActiveFlow>,
    deadline: Option<Instant>,
}

impl CollapsedServer {
    pub fn new(
        server: &ServerConfig,
        mut binder: EndpointBinder,
        registry: Arc<GroupRegistry>,
        dispatcher: Arc<Dispatcher>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, ListenerError> {
        let socket = match binder.bind()? {
            BoundSocket::Datagram(socket) => socket,
            BoundSocket::Stream(listener) => {
                return Err(ListenerError::Socket {
                    transport: "udp",
                    addr: listener.local_addr()?,
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "collapsed mode needs a datagram socket",
                    ),
                })
            }
        };
        let local = socket.local_addr()?;

        Ok(Self {
            server: server.clone(),
            socket,
            local,
            buf: BytesMut::zeroed(server.buffer_len.max(MAX_HEADER_LEN)),
            registry,
            dispatcher,
            metrics,
            filter: ClientFilter::new(server),
            budget: WorkerBudget::new(server.max_flows),
            negotiator: (!server.compat && !server.is_multicast())
                .then(|| HandshakeNegotiator::new(server)),
            flows: HashMap::new(),
            deadline: accept_deadline(server),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Serve datagrams until interrupted, the deadline passes, or the budget
    /// is spent and every admitted flow has ended. A receive error is fatal.
    pub async fn run(&mut self, signal: &mut ShutdownSignal) -> Result<StopReason, ListenerError> {
        info!(local = %self.local, "Serving datagram flows in a single context");

        loop {
            if self.budget.exhausted() && self.flows.is_empty() {
                return Ok(StopReason::BudgetExhausted);
            }

            let received = tokio::select! {
                reason = signal.recv() => {
                    if reason == InterruptReason::DurationExpired && self.server.repeat && signal.clear() {
                        info!("Run duration elapsed, continuing to listen");
                        continue;
                    }
                    return Ok(StopReason::Interrupted(reason));
                }
                received = receive(&self.socket, &mut self.buf, self.deadline) => received,
            };

            let (len, peer) = match received {
                None => return Ok(StopReason::DeadlineElapsed),
                Some(Ok(received)) => received,
                Some(Err(e)) => return Err(ListenerError::Receive(e)),
            };
            if len < DATAGRAM_HEADER_LEN {
                trace!(peer = %peer, len, "Ignoring runt datagram");
                continue;
            }

            let peer = normalize_addr(peer);
            let marker = DatagramMarker::decode(&self.buf[..len])?;
            let sample = PacketSample::from_marker(&marker, len);
            if let Some(metrics) = &self.metrics {
                metrics.record_datagram();
            }

            match DatagramAction::classify(&marker, self.flows.contains_key(&peer)) {
                DatagramAction::Account => {
                    if let Some(flow) = self.flows.get_mut(&peer) {
                        flow.report.update(&sample);
                    }
                }
                DatagramAction::Start => {
                    if self.start_flow(peer, len, &sample).await {
                        self.reply(peer, len).await;
                    }
                }
                DatagramAction::Finish => {
                    self.finish_flow(peer, len, &sample)?;
                    self.reply(peer, len).await;
                }
                DatagramAction::Stray => {
                    prepare_final_reply(&mut self.buf[..len], None)?;
                    self.reply(peer, len).await;
                }
            }
        }
    }

    async fn start_flow(&mut self, peer: SocketAddr, len: usize, sample: &PacketSample) -> bool {
        if self.filter.on_accept(peer, self.registry.is_empty(), &mut self.budget)
            == FilterDecision::Reject
        {
            warn!(peer = %peer, "Rejected datagram flow from disallowed host");
            if let Some(metrics) = &self.metrics {
                metrics.record_rejected();
            }
            return false;
        }

        let handshake = match &self.negotiator {
            Some(negotiator) => {
                match negotiator
                    .negotiate_datagram(&self.socket, &self.buf[..len], peer)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Handshake failed");
                        if let Some(metrics) = &self.metrics {
                            metrics.record_handshake_failure();
                        }
                        return false;
                    }
                }
            }
            None => Default::default(),
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
        info!(peer = %peer, group = %group.id(), "Datagram flow started");

        let follow_up = handshake.header.as_ref().and_then(|header| {
            ClientSettings::from_header(header, peer, self.server.transport, self.server.buffer_len)
        });
        let follow_up = match follow_up {
            Some(client) if client.mode == TestMode::Dual => {
                self.dispatcher.start_client(client);
                None
            }
            other => other,
        };

        let mut report = FlowReport::new(group);
        report.update(sample);
        self.flows.insert(peer, ActiveFlow { report, follow_up });

        if !self.server.single_client {
            self.budget.consume();
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_accepted();
        }
        true
    }

    fn finish_flow(
        &mut self,
        peer: SocketAddr,
        len: usize,
        sample: &PacketSample,
    ) -> Result<(), ListenerError> {
        let Some(mut flow) = self.flows.remove(&peer) else {
            return Ok(());
        };
        flow.report.update(sample);
        let stats = flow.report.close(StdInstant::now());
        self.registry.remove(peer);

        prepare_final_reply(&mut self.buf[..len], Some(&stats))?;
        info!(
            peer = %peer,
            group = %flow.report.group().id(),
            bytes = stats.total_bytes,
            datagrams = stats.datagrams,
            errors = stats.errors,
            out_of_order = stats.out_of_order,
            "Datagram flow complete"
        );

        if let Some(client) = flow.follow_up {
            self.dispatcher.start_client(client);
        }
        Ok(())
    }

    async fn reply(&self, peer: SocketAddr, len: usize) {
        match self.socket.send_to(&self.buf[..len], peer).await {
            Ok(_) => debug!(peer = %peer, len, "Replied to datagram"),
            Err(e) => warn!(peer = %peer, error = %e, "Failed to reply to datagram"),
        }
    }
}

async fn receive(
    socket: &UdpSocket,
    buf: &mut BytesMut,
    deadline: Option<Instant>,
) -> Option<std::io::Result<(usize, SocketAddr)>> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, socket.recv_from(&mut buf[..]))
            .await
            .ok(),
        None => Some(socket.recv_from(&mut buf[..]).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(id: i32) -> DatagramMarker {
        DatagramMarker { id, tv_sec: 0, tv_usec: 0 }
    }

    #[test]
    fn test_datagram_classification() {
        assert_eq!(DatagramAction::classify(&marker(5), true), DatagramAction::Account);
        assert_eq!(DatagramAction::classify(&marker(0), false), DatagramAction::Start);
        assert_eq!(DatagramAction::classify(&marker(-6), true), DatagramAction::Finish);
        assert_eq!(DatagramAction::classify(&marker(-1), false), DatagramAction::Stray);
    }
}
