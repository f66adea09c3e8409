//! Registry Types

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

/// Identifier of a report group. Allocated strictly decreasing from -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate counters of every flow in a group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupTotals {
    pub bytes: u64,
    pub datagrams: u64,
    pub flows: u32,
}

/// Shared state of one logical remote test
#[derive(Debug)]
pub struct GroupHandle {
    id: GroupId,
    totals: Mutex<GroupTotals>,
}

impl GroupHandle {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            totals: Mutex::new(GroupTotals::default()),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Fold traffic from one of the group's flows into the aggregate.
    pub fn record(&self, bytes: u64, datagrams: u64) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.bytes += bytes;
        totals.datagrams += datagrams;
    }

    pub(crate) fn add_flow(&self) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.flows += 1;
    }

    pub fn totals(&self) -> GroupTotals {
        *self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One registered flow
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub peer: SocketAddr,
    pub group: Arc<GroupHandle>,
    pub seq: u64,
}
