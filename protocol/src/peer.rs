use std::collections::HashSet;

use crate::error::ConfigError;
use crate::types::*;

/// A known peer and our last probe result for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: NodeId,
    pub address: String,
    pub last_known_alive: Option<bool>,
}

impl PeerRecord {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self { id: id.into(), address: address.into(), last_known_alive: None }
    }

    pub fn to_gridbug(&self) -> GridBug {
        GridBug {
            id: self.id.clone(),
            host: self.address.clone(),
            alive: self.last_known_alive,
        }
    }
}

/// The peer registry. Records are kept in insertion order (seed list order
/// first, then discovery order) and are never removed.
///
/// Not synchronized on its own; it lives inside [`crate::grid::GridState`]
/// behind the grid lock together with the connectivity graph.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    self_id: NodeId,
    self_address: String,
    version: u64,
    peers: Vec<PeerRecord>,
}

impl NodeRegistry {
    /// Build a registry from a parsed seed list.
    ///
    /// Fails when the list is empty or an id appears twice. If our own id is
    /// absent we register ourselves; if it is present and our address is
    /// `autodiscover`, the seed entry's host becomes our address. A fixed
    /// address always replaces the host listed for us.
    pub fn bootstrap(
        seeds: &SeedList,
        self_id: &str,
        self_address: &NodeAddress,
    ) -> Result<Self, ConfigError> {
        if seeds.gridbugs.is_empty() {
            return Err(ConfigError::EmptySeedList);
        }

        let mut seen = HashSet::new();
        for bug in &seeds.gridbugs {
            if !seen.insert(bug.id.as_str()) {
                return Err(ConfigError::DuplicateId(bug.id.clone()));
            }
        }

        let listed = seeds.gridbugs.iter().find(|b| b.id == self_id);
        let resolved = match (self_address, listed) {
            (NodeAddress::Fixed(addr), _) => addr.clone(),
            (NodeAddress::Autodiscover, Some(entry)) => {
                tracing::info!(host = %entry.host, "Address taken from seed list entry");
                entry.host.clone()
            }
            (NodeAddress::Autodiscover, None) => {
                return Err(ConfigError::AddressUnresolved(self_id.to_string()))
            }
        };

        let mut registry = Self {
            self_id: self_id.to_string(),
            self_address: resolved.clone(),
            version: seeds.version,
            peers: seeds
                .gridbugs
                .iter()
                .map(|b| PeerRecord::new(b.id.clone(), b.host.clone()))
                .collect(),
        };

        match listed {
            None => {
                tracing::info!(node_id = %self_id, host = %resolved, "Not in seed list, registering self");
                registry.add_peer(&resolved, self_id);
            }
            Some(entry) if entry.host != resolved => {
                tracing::info!(seed_host = %entry.host, host = %resolved, "Overriding seed list host for self");
                if let Some(me) = registry.peers.iter_mut().find(|p| p.id == self_id) {
                    me.address = resolved.clone();
                }
            }
            Some(_) => {}
        }

        Ok(registry)
    }

    /// Insert `{address, id}` unless a record with `id` already exists.
    /// Returns whether anything was inserted.
    pub fn add_peer(&mut self, address: &str, id: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        tracing::info!(peer = %id, host = %address, "🌐 Discovered new peer");
        self.peers.push(PeerRecord::new(id, address));
        true
    }

    /// Record a probe result. Returns false if the peer is unknown.
    pub fn set_liveness(&mut self, id: &str, alive: bool) -> bool {
        match self.peers.iter_mut().find(|p| p.id == id) {
            Some(peer) => {
                peer.last_known_alive = Some(alive);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.iter().any(|p| p.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Snapshot for `/bugs`, gossip pushes and the local merge pass
    pub fn snapshot(&self, role: NodeRole) -> Snapshot {
        Snapshot {
            version: self.version,
            gridbugs: self.peers.iter().map(PeerRecord::to_gridbug).collect(),
            node_id: self.self_id.clone(),
            node_role: Some(role.to_string()),
            node_host: Some(self.self_address.clone()),
            node_build: Some(BUILD.to_string()),
        }
    }
}
