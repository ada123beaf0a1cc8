use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

use crate::gossip::PollPhase;
use crate::types::*;

/// Process-wide counters. Shared between the poll loop and the HTTP layer.
#[derive(Debug)]
pub struct Metrics {
    started: DateTime<Utc>,
    cleared: RwLock<DateTime<Utc>>,
    gets: AtomicU64,
    posts: AtomicU64,
    errors: AtomicU64,
    unauthorized: AtomicU64,
    oversize: AtomicU64,
    busy: AtomicU64,
    polls: AtomicU64,
    probe_failures: AtomicU64,
    timeouts: AtomicU64,
    cycles: AtomicU64,
    uri: Mutex<BTreeMap<String, u64>>,
}

/// `/stats` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub gridbug: String,
    pub node_id: NodeId,
    pub node_role: String,
    pub gets: u64,
    pub posts: u64,
    pub errors: u64,
    pub unauthorized: u64,
    pub oversize: u64,
    pub busy: u64,
    pub polls: u64,
    pub probe_failures: u64,
    pub timeouts: u64,
    pub cycles: u64,
    pub phase: PollPhase,
    pub uri: BTreeMap<String, u64>,
    pub ts: i64,
    pub start: i64,
    pub clear: i64,
    pub uptime_secs: i64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            started: now,
            cleared: RwLock::new(now),
            gets: AtomicU64::new(0),
            posts: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            unauthorized: AtomicU64::new(0),
            oversize: AtomicU64::new(0),
            busy: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            uri: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn uptime_secs(&self) -> i64 {
        Utc::now().signed_duration_since(self.started).num_seconds()
    }

    pub fn record_get(&self) {
        bump(&self.gets);
    }

    pub fn record_post(&self) {
        bump(&self.posts);
    }

    pub fn record_error(&self) {
        bump(&self.errors);
    }

    pub fn record_unauthorized(&self) {
        bump(&self.unauthorized);
    }

    pub fn record_oversize(&self) {
        bump(&self.oversize);
    }

    pub fn record_busy(&self) {
        bump(&self.busy);
    }

    pub fn record_poll(&self) {
        bump(&self.polls);
    }

    pub fn record_probe_failure(&self) {
        bump(&self.probe_failures);
    }

    pub fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    pub fn record_cycle(&self) {
        bump(&self.cycles);
    }

    pub async fn record_hit(&self, path: &str) {
        *self.uri.lock().await.entry(path.to_string()).or_insert(0) += 1;
    }

    pub async fn record_reload(&self) {
        *self.cleared.write().await = Utc::now();
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn unauthorized(&self) -> u64 {
        self.unauthorized.load(Ordering::Relaxed)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub async fn report(&self, node_id: &str, role: NodeRole, phase: PollPhase) -> StatsReport {
        let now = Utc::now();
        StatsReport {
            gridbug: BUILD.to_string(),
            node_id: node_id.to_string(),
            node_role: role.to_string(),
            gets: self.gets.load(Ordering::Relaxed),
            posts: self.posts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            phase,
            uri: self.uri.lock().await.clone(),
            ts: now.timestamp(),
            start: self.started.timestamp(),
            clear: self.cleared.read().await.timestamp(),
            uptime_secs: now.signed_duration_since(self.started).num_seconds(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
