//! Report Types

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::protocol::{DatagramMarker, ServerSummary, HEADER_VERSION1};

/// One received datagram as seen by the accounting path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketSample {
    /// Sequence number, termination sign stripped
    pub packet_id: u32,
    /// Sender timestamp carried in the marker
    pub sent: Duration,
    /// Local receive time since the epoch
    pub received: Duration,
    pub len: usize,
}

impl PacketSample {
    pub fn from_marker(marker: &DatagramMarker, len: usize) -> Self {
        Self::at(marker, len, SystemTime::now())
    }

    pub fn at(marker: &DatagramMarker, len: usize, received: SystemTime) -> Self {
        Self {
            packet_id: marker.sequence(),
            sent: Duration::new(marker.tv_sec as u64, marker.tv_usec.saturating_mul(1_000)),
            received: received.duration_since(UNIX_EPOCH).unwrap_or_default(),
            len,
        }
    }

    /// One-way transit time in seconds. Clocks are not synchronized, so only
    /// differences between samples are meaningful.
    pub fn transit(&self) -> f64 {
        self.received.as_secs_f64() - self.sent.as_secs_f64()
    }
}

/// Accumulated statistics of one flow
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferStats {
    pub total_bytes: u64,
    /// Seconds from the first sample to the close
    pub end_time: f64,
    pub errors: u32,
    pub out_of_order: u32,
    /// Highest sequence number seen
    pub datagrams: u32,
    /// Smoothed inter-arrival jitter in seconds
    pub jitter: f64,
}

impl TransferStats {
    /// Record carried back to the sender in the terminal reply.
    pub fn to_summary(&self) -> ServerSummary {
        let (stop_sec, stop_usec) = split_seconds(self.end_time);
        let (jitter_sec, jitter_usec) = split_seconds(self.jitter);
        ServerSummary {
            flags: HEADER_VERSION1,
            total_bytes: self.total_bytes,
            stop_sec,
            stop_usec,
            errors: self.errors,
            out_of_order: self.out_of_order,
            datagrams: self.datagrams,
            jitter_sec,
            jitter_usec,
        }
    }
}

fn split_seconds(value: f64) -> (u32, u32) {
    let value = value.max(0.0);
    let whole = value.trunc();
    (whole as u32, ((value - whole) * 1e6) as u32)
}
