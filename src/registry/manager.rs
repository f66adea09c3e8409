//! Group Registry
//!
//! Tracks every active flow by peer address and hands out the report group a
//! new flow joins. Flows from a host that already has an active flow share its
//! group; otherwise a new group is created with the next (decreasing) id.
//!
//! Lock order: membership first, then the group-id counter. Neither lock is
//! ever held across an await point.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::types::{GroupHandle, GroupId, RegistryEntry};

#[derive(Default)]
struct Members {
    entries: HashMap<SocketAddr, RegistryEntry>,
    /// Peers per host, in insertion order
    by_host: HashMap<IpAddr, Vec<SocketAddr>>,
    next_seq: u64,
}

/// Registry of active flows shared by the listener and the workers
pub struct GroupRegistry {
    members: Mutex<Members>,
    next_group: Mutex<i64>,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold IPv4-mapped IPv6 addresses onto their IPv4 form.
pub fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

/// Host part of a peer address after normalization.
pub fn normalize_host(ip: IpAddr) -> IpAddr {
    normalize_addr(SocketAddr::new(ip, 0)).ip()
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(Members::default()),
            next_group: Mutex::new(0),
        }
    }

    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether this exact peer address has an active flow.
    pub fn contains(&self, peer: SocketAddr) -> bool {
        self.members().entries.contains_key(&normalize_addr(peer))
    }

    /// Entry for this exact peer address.
    pub fn lookup(&self, peer: SocketAddr) -> Option<RegistryEntry> {
        self.members().entries.get(&normalize_addr(peer)).cloned()
    }

    /// Earliest registered entry from the same host, any port.
    pub fn lookup_host(&self, host: IpAddr) -> Option<RegistryEntry> {
        let members = self.members();
        members
            .by_host
            .get(&normalize_host(host))
            .and_then(|peers| peers.first())
            .and_then(|peer| members.entries.get(peer))
            .cloned()
    }

    /// Register a new flow and return the group it belongs to.
    pub fn register(&self, peer: SocketAddr) -> Arc<GroupHandle> {
        let peer = normalize_addr(peer);
        let mut members = self.members();

        if let Some(existing) = members.entries.get(&peer) {
            return Arc::clone(&existing.group);
        }

        let shared = members
            .by_host
            .get(&peer.ip())
            .and_then(|peers| peers.first())
            .and_then(|first| members.entries.get(first))
            .map(|entry| Arc::clone(&entry.group));

        let group = match shared {
            Some(group) => {
                debug!(peer = %peer, group = %group.id(), "Joining existing group");
                group
            }
            None => {
                let id = self.allocate_group_id();
                debug!(peer = %peer, group = %id, "Created new group");
                Arc::new(GroupHandle::new(id))
            }
        };
        group.add_flow();

        let seq = members.next_seq;
        members.next_seq += 1;
        members.entries.insert(
            peer,
            RegistryEntry {
                peer,
                group: Arc::clone(&group),
                seq,
            },
        );
        members.by_host.entry(peer.ip()).or_default().push(peer);

        group
    }

    fn allocate_group_id(&self) -> GroupId {
        let mut next = self.next_group.lock().unwrap_or_else(PoisonError::into_inner);
        *next -= 1;
        GroupId(*next)
    }

    /// Remove the flow for this exact peer address.
    pub fn remove(&self, peer: SocketAddr) -> Option<RegistryEntry> {
        let peer = normalize_addr(peer);
        let mut members = self.members();
        let entry = members.entries.remove(&peer)?;

        if let Some(peers) = members.by_host.get_mut(&peer.ip()) {
            peers.retain(|p| *p != peer);
            if peers.is_empty() {
                members.by_host.remove(&peer.ip());
            }
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.members().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members().entries.is_empty()
    }

    /// All entries in registration order.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<_> = self.members().entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }
}
