//! Connection Acceptor
//!
//! Two sources of new flows behind one trait: the kernel accept queue for
//! stream transport, and demultiplexing of the shared listening socket by
//! sender address for datagram transport.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use super::binder::{BoundSocket, EndpointBinder};
use crate::config::{ServerConfig, Transport};
use crate::error::ListenerError;
use crate::protocol::{DatagramMarker, DATAGRAM_HEADER_LEN, MAX_HEADER_LEN};
use crate::registry::GroupRegistry;
use crate::shutdown::{InterruptReason, ShutdownSignal};

/// Socket owned by one flow
#[derive(Debug)]
pub enum FlowSocket {
    Stream(TcpStream),
    /// Listening socket connected to the flow's sender
    Datagram(UdpSocket),
}

/// A new flow ready for filtering and handshake
#[derive(Debug)]
pub struct AcceptedFlow {
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub socket: FlowSocket,
    /// Datagram consumed while demultiplexing
    pub first_datagram: Option<Bytes>,
}

/// Result of waiting for the next flow
#[derive(Debug)]
pub enum AcceptOutcome {
    Flow(AcceptedFlow),
    Interrupted(InterruptReason),
    /// The run duration bounded the wait and ran out.
    DeadlineElapsed,
}

#[async_trait]
pub trait FlowSource: Send {
    /// Wait for the next new flow, an interrupt, or the deadline.
    async fn next_flow(&mut self, signal: &mut ShutdownSignal)
        -> Result<AcceptOutcome, ListenerError>;

    /// Replace the listening socket after one was handed to a flow or dropped.
    fn rebind(&mut self) -> Result<(), ListenerError>;

    fn transport(&self) -> Transport;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// End of the accept window, if the session runs for a fixed duration.
pub fn accept_deadline(server: &ServerConfig) -> Option<Instant> {
    server.accept_deadline().map(|d| Instant::now() + d)
}

/// Run `fut`, giving up at `deadline`.
async fn until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Accepts stream connections from the kernel queue
pub struct StreamAcceptor {
    binder: EndpointBinder,
    listener: TcpListener,
    deadline: Option<Instant>,
}

impl StreamAcceptor {
    pub fn new(mut binder: EndpointBinder, deadline: Option<Instant>) -> Result<Self, ListenerError> {
        let listener = match binder.bind()? {
            BoundSocket::Stream(listener) => listener,
            BoundSocket::Datagram(_) => unreachable_transport(&binder)?,
        };
        Ok(Self {
            binder,
            listener,
            deadline,
        })
    }
}

#[async_trait]
impl FlowSource for StreamAcceptor {
    async fn next_flow(
        &mut self,
        signal: &mut ShutdownSignal,
    ) -> Result<AcceptOutcome, ListenerError> {
        loop {
            let accepted = tokio::select! {
                reason = signal.recv() => return Ok(AcceptOutcome::Interrupted(reason)),
                accepted = until(self.deadline, self.listener.accept()) => accepted,
            };

            match accepted {
                None => return Ok(AcceptOutcome::DeadlineElapsed),
                Some(Ok((stream, peer))) => {
                    let local = stream.local_addr()?;
                    debug!(peer = %peer, local = %local, "Accepted stream flow");
                    return Ok(AcceptOutcome::Flow(AcceptedFlow {
                        peer,
                        local,
                        socket: FlowSocket::Stream(stream),
                        first_datagram: None,
                    }));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "accept() failed");
                }
            }
        }
    }

    fn rebind(&mut self) -> Result<(), ListenerError> {
        Ok(())
    }

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.binder.local_addr()
    }
}

/// Picks new senders off the shared datagram socket
pub struct DatagramDemux {
    binder: EndpointBinder,
    socket: Option<UdpSocket>,
    buf: BytesMut,
    registry: Arc<GroupRegistry>,
    deadline: Option<Instant>,
}

impl DatagramDemux {
    pub fn new(
        mut binder: EndpointBinder,
        buffer_len: usize,
        registry: Arc<GroupRegistry>,
        deadline: Option<Instant>,
    ) -> Result<Self, ListenerError> {
        let socket = match binder.bind()? {
            BoundSocket::Datagram(socket) => socket,
            BoundSocket::Stream(_) => unreachable_transport(&binder)?,
        };
        Ok(Self {
            binder,
            socket: Some(socket),
            buf: BytesMut::zeroed(buffer_len.max(MAX_HEADER_LEN)),
            registry,
            deadline,
        })
    }
}

#[async_trait]
impl FlowSource for DatagramDemux {
    async fn next_flow(
        &mut self,
        signal: &mut ShutdownSignal,
    ) -> Result<AcceptOutcome, ListenerError> {
        loop {
            if self.socket.is_none() {
                self.rebind()?;
            }
            let Self {
                socket,
                buf,
                registry,
                deadline,
                ..
            } = &mut *self;
            let Some(listening) = socket.as_ref() else {
                continue;
            };

            let received = tokio::select! {
                reason = signal.recv() => return Ok(AcceptOutcome::Interrupted(reason)),
                received = until(*deadline, listening.recv_from(&mut buf[..])) => received,
            };

            let (len, peer) = match received {
                None => return Ok(AcceptOutcome::DeadlineElapsed),
                Some(Ok(received)) => received,
                Some(Err(e)) => {
                    warn!(error = %e, "recvfrom() on listening socket failed");
                    continue;
                }
            };

            if len < DATAGRAM_HEADER_LEN {
                trace!(peer = %peer, len, "Ignoring runt datagram");
                continue;
            }
            let marker = DatagramMarker::decode(&buf[..len])?;
            if marker.is_termination() || registry.contains(peer) {
                trace!(peer = %peer, id = marker.id, "Datagram for a known or finished flow");
                continue;
            }

            let first = Bytes::copy_from_slice(&buf[..len]);
            let Some(flow_socket) = socket.take() else {
                continue;
            };
            // A socket that failed to connect is dropped; the next pass rebinds.
            let Some(flow_socket) = connect_to_sender(flow_socket, peer).await else {
                continue;
            };
            let local = flow_socket.local_addr()?;
            debug!(peer = %peer, local = %local, id = marker.id, "New datagram flow");

            return Ok(AcceptOutcome::Flow(AcceptedFlow {
                peer,
                local,
                socket: FlowSocket::Datagram(flow_socket),
                first_datagram: Some(first),
            }));
        }
    }

    fn rebind(&mut self) -> Result<(), ListenerError> {
        match self.binder.bind()? {
            BoundSocket::Datagram(socket) => {
                self.socket = Some(socket);
                Ok(())
            }
            BoundSocket::Stream(_) => unreachable_transport(&self.binder),
        }
    }

    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.binder.local_addr()
    }
}

/// Dedicate the listening socket to `peer`, or drop it if that fails.
async fn connect_to_sender(socket: UdpSocket, peer: SocketAddr) -> Option<UdpSocket> {
    match socket.connect(peer).await {
        Ok(()) => Some(socket),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to connect flow socket to sender, dropping flow");
            None
        }
    }
}

fn unreachable_transport<T>(binder: &EndpointBinder) -> Result<T, ListenerError> {
    Err(ListenerError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("binder produced the wrong socket type for {}", binder.transport()),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;
    use std::time::Duration;

    fn datagram(id: i32) -> Vec<u8> {
        let mut out = BytesMut::new();
        DatagramMarker { id, tv_sec: 1, tv_usec: 2 }.encode_into(&mut out);
        out.resize(64, 0);
        out.to_vec()
    }

    fn demux(registry: Arc<GroupRegistry>, deadline: Option<Instant>) -> DatagramDemux {
        let binder = EndpointBinder::new("127.0.0.1:0".parse().unwrap(), Transport::Udp);
        DatagramDemux::new(binder, 1470, registry, deadline).unwrap()
    }

    #[tokio::test]
    async fn test_demux_skips_known_senders_and_stray_terminations() {
        let registry = Arc::new(GroupRegistry::new());
        let mut demux = demux(Arc::clone(&registry), None);
        let addr = demux.local_addr().unwrap();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut signal = coordinator.subscribe();

        let known = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        registry.register(known.local_addr().unwrap());
        let fresh = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        known.send_to(&datagram(3), addr).await.unwrap();
        fresh.send_to(&datagram(-1), addr).await.unwrap();
        fresh.send_to(&[1, 2, 3], addr).await.unwrap();
        fresh.send_to(&datagram(0), addr).await.unwrap();

        match demux.next_flow(&mut signal).await.unwrap() {
            AcceptOutcome::Flow(flow) => {
                assert_eq!(flow.peer, fresh.local_addr().unwrap());
                assert_eq!(flow.first_datagram.as_deref(), Some(&datagram(0)[..]));
                assert!(matches!(flow.socket, FlowSocket::Datagram(_)));
            }
            other => panic!("expected a flow, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_connect_drops_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer: SocketAddr = "[::1]:5001".parse().unwrap();
        assert!(connect_to_sender(socket, peer).await.is_none());

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        let connected = connect_to_sender(socket, peer).await.unwrap();
        assert_eq!(connected.peer_addr().unwrap(), peer);
    }

    #[tokio::test]
    async fn test_demux_rebinds_missing_socket() {
        let registry = Arc::new(GroupRegistry::new());
        let mut demux = demux(registry, None);
        let addr = demux.local_addr().unwrap();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut signal = coordinator.subscribe();

        demux.socket = None;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let next = tokio::spawn(async move {
            let outcome = demux.next_flow(&mut signal).await;
            (demux, outcome)
        });

        let sending = async {
            loop {
                let _ = sender.send_to(&datagram(0), addr).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        let (demux, outcome) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::select! {
                joined = next => joined.unwrap(),
                _ = sending => panic!("sender stopped"),
            }
        })
        .await
        .unwrap();

        match outcome.unwrap() {
            AcceptOutcome::Flow(flow) => {
                assert_eq!(flow.peer, sender.local_addr().unwrap());
                assert_eq!(flow.local, addr);
            }
            other => panic!("expected a flow, got {:?}", other),
        }
        assert!(demux.socket.is_none());
    }

    #[tokio::test]
    async fn test_demux_deadline_elapses() {
        let registry = Arc::new(GroupRegistry::new());
        let deadline = Some(Instant::now() + Duration::from_millis(50));
        let mut demux = demux(registry, deadline);
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut signal = coordinator.subscribe();

        assert!(matches!(
            demux.next_flow(&mut signal).await.unwrap(),
            AcceptOutcome::DeadlineElapsed
        ));
    }

    #[tokio::test]
    async fn test_stream_accept_interrupted() {
        let binder = EndpointBinder::new("127.0.0.1:0".parse().unwrap(), Transport::Tcp);
        let mut acceptor = StreamAcceptor::new(binder, None).unwrap();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut signal = coordinator.subscribe();
        coordinator.shutdown();

        assert!(matches!(
            acceptor.next_flow(&mut signal).await.unwrap(),
            AcceptOutcome::Interrupted(InterruptReason::Shutdown)
        ));
    }
}
