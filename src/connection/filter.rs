//! Client Filter and worker budget

use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::registry::normalize_host;

/// Whether an accepted peer may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Reject,
}

/// Restricts the session to one remote host
#[derive(Debug, Clone)]
pub struct ClientFilter {
    allowed: Option<IpAddr>,
    single_client: bool,
}

impl ClientFilter {
    pub fn new(server: &ServerConfig) -> Self {
        Self {
            allowed: server.client_filter.map(normalize_host),
            single_client: server.single_client,
        }
    }

    pub fn allowed(&self) -> Option<IpAddr> {
        self.allowed
    }

    /// Decide on a newly accepted peer. In single-client mode the first peer
    /// seen while no flow is active becomes the only host allowed.
    pub fn on_accept(
        &mut self,
        peer: SocketAddr,
        registry_empty: bool,
        budget: &mut WorkerBudget,
    ) -> FilterDecision {
        let host = normalize_host(peer.ip());

        if self.single_client && registry_empty {
            if self.allowed != Some(host) {
                info!(client = %host, "Serving single client");
            }
            self.allowed = Some(host);
            budget.suspend_for_single_client();
        }

        match self.allowed {
            Some(allowed) if allowed != host => {
                debug!(peer = %peer, allowed = %allowed, "Peer host not allowed");
                FilterDecision::Reject
            }
            _ => FilterDecision::Allow,
        }
    }
}

/// Number of flows the session may still serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerBudget {
    remaining: Option<usize>,
}

impl WorkerBudget {
    /// `0` means unlimited.
    pub fn new(max_flows: usize) -> Self {
        Self {
            remaining: (max_flows > 0).then_some(max_flows),
        }
    }

    pub fn unlimited() -> Self {
        Self { remaining: None }
    }

    pub fn remaining(&self) -> Option<usize> {
        self.remaining
    }

    /// Account one dispatched flow.
    pub fn consume(&mut self) {
        if let Some(n) = self.remaining.as_mut() {
            *n = n.saturating_sub(1);
        }
    }

    /// A new single client took over. Never drops to zero here so the session
    /// lives on while that client may still open more flows.
    pub fn suspend_for_single_client(&mut self) {
        if let Some(n) = self.remaining.as_mut() {
            *n = n.saturating_sub(1).max(1);
        }
    }

    pub fn exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}
