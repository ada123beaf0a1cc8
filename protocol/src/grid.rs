use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{ConfigError, IngressError, MergeError, ReloadError};
use crate::graph::{ConnectivityGraph, GraphElements, RawGraph};
use crate::peer::{NodeRegistry, PeerRecord};
use crate::types::*;

/// Counts from one merge, mostly for logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub discovered: usize,
    pub entries: usize,
    pub grayed: usize,
}

/// Registry and graph together. Every mutation of either goes through a
/// `&mut GridState`, so holding the grid lock makes each merge atomic.
#[derive(Debug)]
pub struct GridState {
    registry: NodeRegistry,
    graph: ConnectivityGraph,
    role: NodeRole,
    /// Bumped by every completed reload
    epoch: u64,
    reloading: bool,
}

impl GridState {
    pub fn new(registry: NodeRegistry, role: NodeRole) -> Self {
        Self {
            registry,
            graph: ConnectivityGraph::new(),
            role,
            epoch: 0,
            reloading: false,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &ConnectivityGraph {
        &self.graph
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading
    }

    pub fn snapshot(&self) -> Snapshot {
        self.registry.snapshot(self.role)
    }

    pub fn add_peer(&mut self, address: &str, id: &str) -> bool {
        self.registry.add_peer(address, id)
    }

    pub fn set_liveness(&mut self, id: &str, alive: bool) -> bool {
        self.registry.set_liveness(id, alive)
    }

    /// Fold a report into the registry and graph.
    ///
    /// `None` merges our own probe results under our id. A peer report first
    /// registers its source and every peer it mentions, then runs the
    /// authoritative and decay passes. Malformed reports are rejected before
    /// anything changes.
    pub fn merge(
        &mut self,
        report: Option<&Snapshot>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<MergeSummary, MergeError> {
        let local;
        let report = match report {
            Some(report) => report,
            None => {
                local = self.snapshot();
                &local
            }
        };
        report.validate()?;

        let mut summary = MergeSummary { entries: report.gridbugs.len(), ..Default::default() };
        if let Some(host) = &report.node_host {
            summary.discovered += usize::from(self.registry.add_peer(host, &report.node_id));
        }
        for bug in &report.gridbugs {
            summary.discovered += usize::from(self.registry.add_peer(&bug.host, &bug.id));
        }
        summary.grayed = self.graph.apply_report(report, now, ttl);
        Ok(summary)
    }
}

/// Cloneable handle to the process-wide grid state
#[derive(Debug, Clone)]
pub struct Grid {
    state: Arc<RwLock<GridState>>,
    ttl: Duration,
}

impl Grid {
    pub fn new(registry: NodeRegistry, role: NodeRole, ttl: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(GridState::new(registry, role))),
            ttl,
        }
    }

    pub async fn read(&self) -> tokio::sync::RwLockReadGuard<'_, GridState> {
        self.state.read().await
    }

    pub async fn add_peer(&self, address: &str, id: &str) -> bool {
        self.state.write().await.add_peer(address, id)
    }

    /// Merge a report pushed to us by a peer. Refused while a reload runs.
    pub async fn merge_inbound(&self, report: &Snapshot) -> Result<MergeSummary, IngressError> {
        let mut state = self.state.write().await;
        if state.reloading {
            return Err(IngressError::Busy);
        }
        Ok(state.merge(Some(report), Utc::now(), self.ttl)?)
    }

    /// Merge on behalf of a poll cycle started under `epoch`. Returns `None`
    /// if a reload started or finished since, in which case nothing is written.
    pub async fn merge_for_epoch(
        &self,
        epoch: u64,
        report: Option<&Snapshot>,
    ) -> Option<Result<MergeSummary, MergeError>> {
        let mut state = self.state.write().await;
        if state.reloading || state.epoch != epoch {
            return None;
        }
        Some(state.merge(report, Utc::now(), self.ttl))
    }

    /// Record a probe result taken during a cycle started under `epoch`
    pub async fn set_liveness(&self, epoch: u64, id: &str, alive: bool) -> bool {
        let mut state = self.state.write().await;
        if state.reloading || state.epoch != epoch {
            return false;
        }
        state.set_liveness(id, alive)
    }

    /// Peers to poll plus the epoch they were read under. `None` while a
    /// reload is in flight.
    pub async fn poll_targets(&self) -> Option<(u64, Vec<PeerRecord>)> {
        let state = self.state.read().await;
        if state.reloading {
            return None;
        }
        Some((state.epoch, state.registry.peers().to_vec()))
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.state.read().await.snapshot()
    }

    pub async fn raw_graph(&self) -> RawGraph {
        self.state.read().await.graph.raw()
    }

    pub async fn graph_elements(&self) -> GraphElements {
        self.state.read().await.graph.elements()
    }

    pub async fn is_reloading(&self) -> bool {
        self.state.read().await.reloading
    }

    pub async fn epoch(&self) -> u64 {
        self.state.read().await.epoch
    }

    /// Mark a reload as started. Fails if one is already running.
    pub async fn begin_reload(&self) -> Result<(), ReloadError> {
        let mut state = self.state.write().await;
        if state.reloading {
            return Err(ReloadError::Busy);
        }
        state.reloading = true;
        Ok(())
    }

    /// Swap in a freshly bootstrapped registry and an empty graph, or keep
    /// the current state if bootstrap failed. Clears the reload flag either way.
    pub async fn finish_reload(
        &self,
        bootstrapped: Result<NodeRegistry, ConfigError>,
    ) -> Result<usize, ReloadError> {
        let mut state = self.state.write().await;
        state.reloading = false;
        let registry = bootstrapped?;
        let count = registry.len();
        state.registry = registry;
        state.graph = ConnectivityGraph::new();
        state.epoch += 1;
        Ok(count)
    }
}
