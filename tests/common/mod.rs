//! Shared helpers for listener integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

use flowgate::config::{Config, Transport};
use flowgate::connection::{FlowSettings, FlowSocket, FlowWorker};
use flowgate::protocol::{DatagramMarker, PeerVersion};
use flowgate::registry::{GroupId, GroupRegistry};

/// What the recording worker saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    Started {
        peer: SocketAddr,
        group: GroupId,
        peer_version: Option<PeerVersion>,
    },
    Drained {
        peer: SocketAddr,
        received: Vec<u8>,
    },
}

/// Reports every flow it serves and drains stream flows to EOF
pub struct RecordingWorker {
    events: mpsc::UnboundedSender<FlowEvent>,
}

impl RecordingWorker {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FlowEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events }), rx)
    }
}

#[async_trait]
impl FlowWorker for RecordingWorker {
    async fn run(&self, mut flow: FlowSettings) -> anyhow::Result<()> {
        let _ = self.events.send(FlowEvent::Started {
            peer: flow.peer,
            group: flow.group.id(),
            peer_version: flow.peer_version,
        });

        let mut received = Vec::new();
        match flow.socket {
            FlowSocket::Stream(ref mut stream) => {
                stream.read_to_end(&mut received).await?;
            }
            FlowSocket::Datagram(ref socket) => {
                let mut buf = vec![0u8; flow.buffer_len];
                loop {
                    let n = socket.recv(&mut buf).await?;
                    let marker = DatagramMarker::decode(&buf[..n])?;
                    if marker.is_termination() {
                        break;
                    }
                }
            }
        }

        let _ = self.events.send(FlowEvent::Drained {
            peer: flow.peer,
            received,
        });
        Ok(())
    }
}

pub fn stream_config() -> Config {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.server.transport = Transport::Tcp;
    config.server.buffer_len = 8192;
    config.server.handshake_timeout = Duration::from_secs(2);
    config.server.shutdown_timeout = Duration::from_secs(2);
    config
}

pub fn datagram_config() -> Config {
    let mut config = stream_config();
    config.server.transport = Transport::Udp;
    config.server.buffer_len = 1470;
    config
}

/// Connect to `server` from a specific loopback address.
pub async fn connect_from(local: &str, server: SocketAddr) -> TcpStream {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind(format!("{}:0", local).parse().unwrap()).unwrap();
    socket.connect(server).await.unwrap()
}

/// Test datagram: marker followed by `body`, zero padded to `len`.
pub fn datagram(id: i32, body: &[u8], len: usize) -> Vec<u8> {
    let mut out = BytesMut::new();
    DatagramMarker { id, tv_sec: 0, tv_usec: 0 }.encode_into(&mut out);
    out.extend_from_slice(body);
    if out.len() < len {
        out.resize(len, 0);
    }
    out.to_vec()
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<FlowEvent>) -> FlowEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a flow event")
        .expect("worker channel closed")
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn group_of(registry: &GroupRegistry, peer: SocketAddr) -> Option<GroupId> {
    registry.lookup(peer).map(|entry| entry.group.id())
}
