//! Default flow worker: receive and account, never send test traffic.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use super::acceptor::FlowSocket;
use super::worker::{FlowSettings, FlowWorker};
use crate::protocol::{DatagramMarker, DATAGRAM_HEADER_LEN, MAX_HEADER_LEN};
use crate::registry::{GroupHandle, GroupRegistry};
use crate::report::{prepare_final_reply, FlowReport, PacketSample};

/// Drains every flow and reports its totals
pub struct SinkWorker {
    registry: Arc<GroupRegistry>,
}

impl SinkWorker {
    pub fn new(registry: Arc<GroupRegistry>) -> Self {
        Self { registry }
    }

    async fn drain_datagrams(
        &self,
        flow: &FlowSettings,
        socket: &UdpSocket,
    ) -> anyhow::Result<()> {
        let mut report = FlowReport::new(Arc::clone(&flow.group));
        let mut buf = vec![0u8; flow.buffer_len.max(MAX_HEADER_LEN)];

        if let Some(first) = &flow.initial_datagram {
            let marker = DatagramMarker::decode(first)?;
            report.update(&PacketSample::from_marker(&marker, first.len()));
        }

        loop {
            let len = socket.recv(&mut buf).await?;
            if len < DATAGRAM_HEADER_LEN {
                continue;
            }
            let marker = DatagramMarker::decode(&buf[..len])?;
            report.update(&PacketSample::from_marker(&marker, len));

            if marker.is_termination() {
                let stats = report.close(Instant::now());
                self.registry.remove(flow.peer);

                prepare_final_reply(&mut buf[..len], Some(&stats))?;
                if let Err(e) = socket.send(&buf[..len]).await {
                    warn!(error = %e, "Failed to send final reply");
                }

                info!(
                    bytes = stats.total_bytes,
                    datagrams = stats.datagrams,
                    errors = stats.errors,
                    out_of_order = stats.out_of_order,
                    jitter_ms = stats.jitter * 1e3,
                    "Datagram flow complete"
                );
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl FlowWorker for SinkWorker {
    async fn run(&self, mut flow: FlowSettings) -> anyhow::Result<()> {
        debug!(
            transport = %flow.transport,
            local = %flow.local,
            peer_version = ?flow.peer_version,
            "Sink worker serving flow"
        );

        match flow.socket {
            FlowSocket::Datagram(ref socket) => self.drain_datagrams(&flow, socket).await,
            FlowSocket::Stream(ref mut stream) => {
                drain_stream(stream, &flow.group, flow.buffer_len).await
            }
        }
    }
}

async fn drain_stream(
    stream: &mut TcpStream,
    group: &GroupHandle,
    buffer_len: usize,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; buffer_len];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        group.record(n as u64, 0);
    }

    info!(bytes = total, "Stream flow complete");
    Ok(())
}
