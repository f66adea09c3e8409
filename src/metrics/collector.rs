//! Metrics Collector

use prometheus::{Gauge, IntCounter, Registry, TextEncoder};
use tracing::error;

/// Listener counters exported in the Prometheus text format
pub struct Metrics {
    prometheus_registry: Registry,

    flows_accepted_total: IntCounter,
    flows_rejected_total: IntCounter,
    handshake_failures_total: IntCounter,
    handshake_acks_total: IntCounter,
    groups_created_total: IntCounter,
    datagrams_total: IntCounter,
    active_flows: Gauge,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> anyhow::Result<Self> {
        let prometheus_registry = Registry::new();

        let flows_accepted_total = IntCounter::new(
            "flowgate_flows_accepted_total",
            "Flows accepted and handed to a worker or the collapsed loop",
        )?;
        let flows_rejected_total = IntCounter::new(
            "flowgate_flows_rejected_total",
            "Flows refused by the client filter",
        )?;
        let handshake_failures_total = IntCounter::new(
            "flowgate_handshake_failures_total",
            "Flows abandoned because the client header never arrived",
        )?;
        let handshake_acks_total = IntCounter::new(
            "flowgate_handshake_acks_total",
            "Header acknowledgments sent to peers",
        )?;
        let groups_created_total = IntCounter::new(
            "flowgate_groups_created_total",
            "Report groups allocated",
        )?;
        let datagrams_total = IntCounter::new(
            "flowgate_datagrams_total",
            "Datagrams accounted in collapsed mode",
        )?;
        let active_flows = Gauge::new("flowgate_active_flows", "Flows currently being served")?;

        prometheus_registry.register(Box::new(flows_accepted_total.clone()))?;
        prometheus_registry.register(Box::new(flows_rejected_total.clone()))?;
        prometheus_registry.register(Box::new(handshake_failures_total.clone()))?;
        prometheus_registry.register(Box::new(handshake_acks_total.clone()))?;
        prometheus_registry.register(Box::new(groups_created_total.clone()))?;
        prometheus_registry.register(Box::new(datagrams_total.clone()))?;
        prometheus_registry.register(Box::new(active_flows.clone()))?;

        Ok(Self {
            prometheus_registry,
            flows_accepted_total,
            flows_rejected_total,
            handshake_failures_total,
            handshake_acks_total,
            groups_created_total,
            datagrams_total,
            active_flows,
        })
    }

    pub fn record_accepted(&self) {
        self.flows_accepted_total.inc();
    }

    pub fn record_rejected(&self) {
        self.flows_rejected_total.inc();
    }

    pub fn record_handshake_failure(&self) {
        self.handshake_failures_total.inc();
    }

    pub fn record_ack(&self) {
        self.handshake_acks_total.inc();
    }

    pub fn record_group_created(&self) {
        self.groups_created_total.inc();
    }

    pub fn record_datagram(&self) {
        self.datagrams_total.inc();
    }

    pub fn flow_started(&self) {
        self.active_flows.inc();
    }

    pub fn flow_finished(&self) {
        self.active_flows.dec();
    }

    pub fn accepted(&self) -> u64 {
        self.flows_accepted_total.get()
    }

    pub fn rejected(&self) -> u64 {
        self.flows_rejected_total.get()
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.prometheus_registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }
}
