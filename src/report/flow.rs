//! Per-flow datagram accounting

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::types::{PacketSample, TransferStats};
use crate::protocol::{
    CodecError, DatagramMarker, ServerSummary, DATAGRAM_HEADER_LEN, SERVER_SUMMARY_LEN,
};
use crate::registry::GroupHandle;

/// Running report of one datagram flow
#[derive(Debug)]
pub struct FlowReport {
    group: Arc<GroupHandle>,
    started: Instant,
    last_id: u32,
    last_transit: Option<f64>,
    stats: TransferStats,
    closed: bool,
}

impl FlowReport {
    pub fn new(group: Arc<GroupHandle>) -> Self {
        Self {
            group,
            started: Instant::now(),
            last_id: 0,
            last_transit: None,
            stats: TransferStats::default(),
            closed: false,
        }
    }

    pub fn group(&self) -> &Arc<GroupHandle> {
        &self.group
    }

    /// Account one received datagram.
    pub fn update(&mut self, sample: &PacketSample) {
        if self.closed {
            return;
        }

        self.stats.total_bytes += sample.len as u64;
        self.group.record(sample.len as u64, 1);

        let transit = sample.transit();
        if let Some(last) = self.last_transit {
            let delta = (transit - last).abs();
            self.stats.jitter += (delta - self.stats.jitter) / 16.0;
        }
        self.last_transit = Some(transit);

        let id = sample.packet_id;
        if id > self.last_id.saturating_add(1) {
            self.stats.errors += id - self.last_id - 1;
        } else if id < self.last_id.saturating_add(1) && self.stats.datagrams > 0 {
            self.stats.out_of_order += 1;
        }
        if id > self.last_id || self.stats.datagrams == 0 {
            self.last_id = id;
        }
        self.stats.datagrams = self.stats.datagrams.max(id);
    }

    /// Stop timing. Late datagrams counted as lost are taken back out.
    pub fn close(&mut self, at: Instant) -> TransferStats {
        if !self.closed {
            self.closed = true;
            self.stats.end_time = at.saturating_duration_since(self.started).as_secs_f64();
            self.stats.errors = self.stats.errors.saturating_sub(self.stats.out_of_order);
            debug!(
                group = %self.group.id(),
                datagrams = self.stats.datagrams,
                errors = self.stats.errors,
                out_of_order = self.stats.out_of_order,
                jitter = self.stats.jitter,
                "Flow report closed"
            );
        }
        self.stats
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }
}

/// Fill in the terminal reply to a sender's termination datagram.
///
/// With `stats` the summary is embedded behind the marker; without it a
/// stray termination gets its summary flags cleared. Nothing is written
/// unless the datagram is strictly larger than marker plus summary.
/// Returns whether the summary area was touched.
pub fn prepare_final_reply(
    datagram: &mut [u8],
    stats: Option<&TransferStats>,
) -> Result<bool, CodecError> {
    DatagramMarker::decode(datagram)?;
    if datagram.len() <= DATAGRAM_HEADER_LEN + SERVER_SUMMARY_LEN {
        return Ok(false);
    }

    let body = &mut datagram[DATAGRAM_HEADER_LEN..];
    match stats {
        Some(stats) => stats.to_summary().write_into(body)?,
        None => body[..4].copy_from_slice(&0u32.to_be_bytes()),
    }
    Ok(true)
}

/// Read back a summary embedded by [`prepare_final_reply`].
pub fn read_summary(datagram: &[u8]) -> Result<ServerSummary, CodecError> {
    ServerSummary::decode(datagram.get(DATAGRAM_HEADER_LEN..).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HEADER_VERSION1;
    use crate::registry::GroupId;
    use bytes::BytesMut;
    use std::time::{Duration, SystemTime};

    fn sample(id: u32, sent_ms: u64, received_ms: u64) -> PacketSample {
        PacketSample {
            packet_id: id,
            sent: Duration::from_millis(sent_ms),
            received: Duration::from_millis(received_ms),
            len: 100,
        }
    }

    fn report() -> FlowReport {
        FlowReport::new(Arc::new(GroupHandle::new(GroupId(-1))))
    }

    #[test]
    fn test_gap_counts_as_errors_and_datagrams_is_highest_id() {
        let mut report = report();
        report.update(&sample(0, 0, 10));
        report.update(&sample(5, 50, 60));
        report.update(&sample(6, 60, 70));

        let stats = report.close(Instant::now());
        assert_eq!(stats.datagrams, 6);
        assert_eq!(stats.errors, 4);
        assert_eq!(stats.out_of_order, 0);
        assert_eq!(stats.total_bytes, 300);
        assert_eq!(report.group().totals().datagrams, 3);
    }

    #[test]
    fn test_late_datagram_is_out_of_order_not_lost() {
        let mut report = report();
        report.update(&sample(1, 0, 10));
        report.update(&sample(3, 20, 30));
        report.update(&sample(2, 10, 40));

        let stats = report.close(Instant::now());
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.datagrams, 3);
    }

    #[test]
    fn test_jitter_follows_smoothed_transit_difference() {
        let mut report = report();
        report.update(&sample(1, 0, 10));
        report.update(&sample(2, 10, 36));

        // |26ms - 10ms| / 16
        let expected = 0.016 / 16.0;
        assert!((report.stats().jitter - expected).abs() < 1e-9);
    }

    #[test]
    fn test_constant_transit_has_no_jitter() {
        let mut report = report();
        for id in 1..=10 {
            report.update(&sample(id, id as u64 * 10, id as u64 * 10 + 5));
        }
        assert!(report.stats().jitter.abs() < 1e-12);
    }

    #[test]
    fn test_final_reply_embeds_summary_when_room() {
        let mut report = report();
        let now = SystemTime::now();
        let marker = DatagramMarker { id: -6, tv_sec: 0, tv_usec: 0 };
        report.update(&PacketSample::at(&marker, 100, now));
        let stats = report.close(Instant::now());

        let mut buf = BytesMut::new();
        marker.encode_into(&mut buf);
        buf.resize(100, 0);

        assert!(prepare_final_reply(&mut buf, Some(&stats)).unwrap());
        let summary = read_summary(&buf).unwrap();
        assert_eq!(summary.flags, HEADER_VERSION1);
        assert_eq!(summary.datagrams, 6);
    }

    #[test]
    fn test_final_reply_untouched_without_room() {
        let mut buf = BytesMut::new();
        DatagramMarker { id: -3, tv_sec: 0, tv_usec: 0 }.encode_into(&mut buf);
        buf.resize(DATAGRAM_HEADER_LEN + SERVER_SUMMARY_LEN, 0xAA);

        let stats = TransferStats::default();
        assert!(!prepare_final_reply(&mut buf, Some(&stats)).unwrap());
        assert!(buf[DATAGRAM_HEADER_LEN..].iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn test_stray_termination_clears_flags() {
        let mut buf = BytesMut::new();
        DatagramMarker { id: -1, tv_sec: 0, tv_usec: 0 }.encode_into(&mut buf);
        buf.resize(64, 0xFF);

        assert!(prepare_final_reply(&mut buf, None).unwrap());
        assert_eq!(read_summary(&buf).unwrap().flags, 0);
    }
}
