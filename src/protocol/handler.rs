//! Handshake Negotiator
//!
//! Reads the optional client header of a freshly accepted flow and answers an
//! extended header with this server's version. For stream transport the header
//! is only peeked, so the bytes stay queued for the worker's own accounting.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use super::{ClientHeader, HeaderAck, PeerVersion};
use crate::config::ServerConfig;
use crate::error::ListenerError;
use crate::protocol::constants::*;

/// Pause between peeks while a partially received header fills up
const PEEK_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Result of a completed handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub header: Option<ClientHeader>,
    pub acked: bool,
}

impl HandshakeOutcome {
    pub fn peer_version(&self) -> Option<PeerVersion> {
        self.header.as_ref().and_then(|h| h.version)
    }
}

/// Performs the version exchange with new peers
#[derive(Debug, Clone)]
pub struct HandshakeNegotiator {
    report_interval: Option<Duration>,
    duration: Option<Duration>,
    fallback_timeout: Duration,
    buffer_len: usize,
}

impl HandshakeNegotiator {
    pub fn new(server: &ServerConfig) -> Self {
        Self {
            report_interval: server.report_interval,
            duration: server.duration,
            fallback_timeout: server.handshake_timeout,
            buffer_len: server.buffer_len,
        }
    }

    /// Bound on waiting for the header: half the report interval, else half
    /// the run duration.
    pub fn receive_timeout(&self) -> Duration {
        match (self.report_interval, self.duration) {
            (Some(interval), _) if !interval.is_zero() => interval / 2,
            (_, Some(duration)) if !duration.is_zero() => duration / 2,
            _ => self.fallback_timeout,
        }
    }

    /// Bound on sending the ack, clamped to [HDRXACKMIN, HDRXACKMAX].
    pub fn send_timeout(&self) -> Duration {
        let quarter = match (self.report_interval, self.duration) {
            (Some(interval), _) if !interval.is_zero() => interval / 4,
            (_, Some(duration)) if !duration.is_zero() => duration / 4,
            _ => Duration::ZERO,
        };
        quarter.clamp(
            Duration::from_micros(HDRXACKMIN),
            Duration::from_micros(HDRXACKMAX),
        )
    }

    /// Peek the header from a stream flow and ack an extended one.
    pub async fn negotiate_stream(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
    ) -> Result<HandshakeOutcome, ListenerError> {
        let deadline = Instant::now() + self.receive_timeout();
        let mut buf = [0u8; CLIENT_HEADER_MAX_LEN];

        peek_within(stream, &mut buf[..FLAGS_LEN], deadline, peer).await?;
        let flags = ClientHeader::peek_flags(&buf)?;
        if flags & (HEADER_EXTEND | HEADER_VERSION1) == 0 {
            debug!(peer = %peer, flags, "No versioned header from peer");
            return Ok(HandshakeOutcome::default());
        }

        let len = ClientHeader::encoded_len(flags);
        peek_within(stream, &mut buf[..len], deadline, peer).await?;
        let header = ClientHeader::decode(&buf[..len])?;

        let acked = if header.is_extended() {
            self.send_stream_ack(stream, peer, header.version).await
        } else {
            false
        };

        Ok(HandshakeOutcome {
            header: Some(header),
            acked,
        })
    }

    /// Read the header carried behind the marker of a flow's first datagram
    /// and ack an extended one.
    pub async fn negotiate_datagram(
        &self,
        socket: &UdpSocket,
        datagram: &[u8],
        peer: SocketAddr,
    ) -> Result<HandshakeOutcome, ListenerError> {
        let body = datagram.get(DATAGRAM_HEADER_LEN..).unwrap_or_default();
        let flags = match ClientHeader::peek_flags(body) {
            Ok(flags) => flags,
            Err(_) => return Ok(HandshakeOutcome::default()),
        };
        if flags & (HEADER_EXTEND | HEADER_VERSION1) == 0 {
            return Ok(HandshakeOutcome::default());
        }

        let header = match ClientHeader::decode(body) {
            Ok(header) => header,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Ignoring incomplete client header in datagram");
                return Ok(HandshakeOutcome::default());
            }
        };

        let mut acked = false;
        if header.is_extended() {
            if self.buffer_len < HEADER_ACK_LEN {
                warn!(
                    buffer_len = self.buffer_len,
                    needed = HEADER_ACK_LEN,
                    "Buffer length too small for the peer exchange"
                );
            }
            let ack = HeaderAck::for_server().encode();
            match socket.send_to(&ack, peer).await {
                Ok(_) => {
                    debug!(peer = %peer, peer_version = ?header.version, "Sent header ack");
                    acked = true;
                }
                Err(e) => warn!(peer = %peer, error = %e, "Failed to send header ack"),
            }
        }

        Ok(HandshakeOutcome {
            header: Some(header),
            acked,
        })
    }

    async fn send_stream_ack(
        &self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        peer_version: Option<PeerVersion>,
    ) -> bool {
        let ack = HeaderAck::for_server().encode();

        let previous = stream.nodelay().unwrap_or(false);
        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %peer, error = %e, "Failed to enable TCP_NODELAY for header ack");
        }

        let sent = match timeout(self.send_timeout(), stream.write_all(&ack)).await {
            Ok(Ok(())) => {
                debug!(peer = %peer, peer_version = ?peer_version, "Sent header ack");
                true
            }
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Failed to send header ack");
                false
            }
            Err(_) => {
                warn!(peer = %peer, timeout = ?self.send_timeout(), "Header ack send timed out");
                false
            }
        };

        if let Err(e) = stream.set_nodelay(previous) {
            warn!(peer = %peer, error = %e, "Failed to restore TCP_NODELAY after header ack");
        }

        sent
    }
}

async fn peek_within(
    stream: &TcpStream,
    buf: &mut [u8],
    deadline: Instant,
    peer: SocketAddr,
) -> Result<(), ListenerError> {
    let wanted = buf.len();
    match timeout_at(deadline, peek_exact(stream, buf)).await {
        Ok(Ok(n)) if n >= wanted => Ok(()),
        Ok(Ok(n)) => Err(ListenerError::Handshake {
            peer,
            reason: format!("short header: {} of {} bytes", n, wanted),
        }),
        Ok(Err(e)) => Err(ListenerError::Handshake {
            peer,
            reason: format!("peek failed: {}", e),
        }),
        Err(_) => Err(ListenerError::Handshake {
            peer,
            reason: format!("timed out waiting for {} header bytes", wanted),
        }),
    }
}

/// Peek until `buf` can be filled or the peer closes.
async fn peek_exact(stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = stream.peek(buf).await?;
        if n == 0 || n >= buf.len() {
            return Ok(n);
        }
        tokio::time::sleep(PEEK_RETRY_INTERVAL).await;
    }
}
