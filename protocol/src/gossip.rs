use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::client::{PeerClient, ProbeOutcome};
use crate::error::{ConfigError, MergeError, ReloadError, TransportError};
use crate::grid::{Grid, MergeSummary};
use crate::metrics::Metrics;
use crate::peer::{NodeRegistry, PeerRecord};
use crate::seed::{self, SeedSource};
use crate::types::*;

/// Where the poll loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    Idle,
    Probing,
    Gossiping,
    Reconciling,
    Upstreaming,
    Sleeping,
}

/// What happened to the pull half of an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Merged(MergeSummary),
    /// A reload happened while the pull was in flight; nothing was written
    Stale,
    Failed(TransportError),
    Rejected(MergeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub push: Result<(), TransportError>,
    pub pull: PullOutcome,
}

/// Summary of one completed poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub probed: usize,
    pub alive: usize,
    pub exchanged: usize,
    pub reconciled: bool,
    pub upstreamed: Option<bool>,
}

/// A gridbug node: owns the shared grid state and talks to its peers.
///
/// The poll loop ([`GossipNode::run`]) and the HTTP ingress both operate on
/// the same [`Grid`]; network calls never happen while the grid lock is held.
#[derive(Debug)]
pub struct GossipNode {
    pub settings: NodeSettings,
    pub grid: Grid,
    pub metrics: Arc<Metrics>,
    seeds: SeedSource,
    client: PeerClient,
    phase: watch::Sender<PollPhase>,
}

impl GossipNode {
    /// Build a node around an already bootstrapped registry
    pub fn new(settings: NodeSettings, seeds: SeedSource, registry: NodeRegistry) -> Self {
        let grid = Grid::new(registry, settings.role, settings.edge_ttl);
        let client = PeerClient::new(settings.secret.clone(), settings.call_timeout);
        let (phase, _) = watch::channel(PollPhase::Idle);
        Self {
            settings,
            grid,
            metrics: Arc::new(Metrics::new()),
            seeds,
            client,
            phase,
        }
    }

    /// Validate settings, load the seed list and bootstrap the registry.
    /// Any error here is fatal: the node must not start serving.
    pub async fn bootstrap(settings: NodeSettings, seeds: SeedSource) -> Result<Self, ConfigError> {
        settings.validate()?;
        tracing::info!(
            node_id = %settings.node_id,
            seeds = %seeds,
            "🌱 Bootstrapping gridbug node"
        );

        let client = PeerClient::new(settings.secret.clone(), settings.call_timeout);
        let registry = load_registry(&client, &seeds, &settings).await?;
        tracing::info!(
            peers = registry.len(),
            host = %registry.self_address(),
            "Bootstrap complete"
        );
        Ok(Self::new(settings, seeds, registry))
    }

    pub fn phase(&self) -> PollPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<PollPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: PollPhase) {
        self.phase.send_replace(phase);
    }

    /// Probe one peer, counting the attempt and any failure
    pub async fn probe(&self, peer: &PeerRecord) -> ProbeOutcome {
        self.metrics.record_poll();
        let outcome = self.client.probe(&peer.address).await;
        match &outcome {
            ProbeOutcome::Alive => {
                tracing::debug!(peer = %peer.id, host = %peer.address, "Got response from peer");
            }
            ProbeOutcome::Dead(status) => {
                self.metrics.record_probe_failure();
                tracing::debug!(peer = %peer.id, host = %peer.address, status, "Peer answered with failure");
            }
            ProbeOutcome::Unreachable(e) => {
                self.metrics.record_probe_failure();
                if *e == TransportError::Timeout {
                    self.metrics.record_timeout();
                }
                tracing::debug!(peer = %peer.id, host = %peer.address, error = %e, "No response from peer");
            }
        }
        outcome
    }

    /// Push our snapshot to `peer` and pull theirs back. The two halves are
    /// independent; neither failure stops the other.
    pub async fn exchange(&self, epoch: u64, peer: &PeerRecord, local: &Snapshot) -> ExchangeOutcome {
        let (push, pull) = tokio::join!(
            self.client.push(&peer.address, local),
            self.client.pull(&peer.address)
        );

        if let Err(e) = &push {
            self.note_transport_error(e);
            tracing::debug!(peer = %peer.id, error = %e, "Unable to send graph to peer");
        }

        let pull = match pull {
            Ok(report) => match self.grid.merge_for_epoch(epoch, Some(&report)).await {
                Some(Ok(summary)) => PullOutcome::Merged(summary),
                Some(Err(e)) => {
                    tracing::warn!(peer = %peer.id, error = %e, "Peer sent a malformed registry");
                    PullOutcome::Rejected(e)
                }
                None => PullOutcome::Stale,
            },
            Err(e) => {
                self.note_transport_error(&e);
                tracing::debug!(peer = %peer.id, error = %e, "Unable to update graph from peer");
                PullOutcome::Failed(e)
            }
        };

        ExchangeOutcome { push, pull }
    }

    fn note_transport_error(&self, e: &TransportError) {
        if *e == TransportError::Timeout {
            self.metrics.record_timeout();
        }
    }

    /// One full poll cycle. Returns `None` without doing anything while a
    /// reload is in flight.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let (epoch, peers) = self.grid.poll_targets().await?;
        let fanout = self.settings.fanout;
        let mut report = CycleReport { probed: peers.len(), ..Default::default() };

        self.set_phase(PollPhase::Probing);
        let alive: Vec<PeerRecord> = stream::iter(peers)
            .map(|peer| async move {
                let alive = self.probe(&peer).await.is_alive();
                self.grid.set_liveness(epoch, &peer.id, alive).await;
                alive.then_some(peer)
            })
            .buffer_unordered(fanout)
            .filter_map(|peer| async move { peer })
            .collect()
            .await;
        report.alive = alive.len();

        self.set_phase(PollPhase::Gossiping);
        let local = self.grid.snapshot().await;
        let local = &local;
        let targets: Vec<PeerRecord> =
            alive.into_iter().filter(|p| p.id != self.settings.node_id).collect();
        report.exchanged = stream::iter(targets)
            .map(|peer| async move { self.exchange(epoch, &peer, local).await })
            .buffer_unordered(fanout)
            .collect::<Vec<_>>()
            .await
            .len();

        self.set_phase(PollPhase::Reconciling);
        match self.grid.merge_for_epoch(epoch, None).await {
            Some(Ok(summary)) => {
                report.reconciled = true;
                tracing::debug!(entries = summary.entries, grayed = summary.grayed, "Graph reconciled");
            }
            Some(Err(e)) => tracing::warn!(error = %e, "Local merge failed"),
            None => tracing::debug!("Reload happened mid-cycle, skipping reconcile"),
        }

        self.set_phase(PollPhase::Upstreaming);
        if let Some(upstream) = &self.settings.upstream {
            let snapshot = self.grid.snapshot().await;
            let sent = match self.client.push(upstream, &snapshot).await {
                Ok(()) => true,
                Err(e) => {
                    self.note_transport_error(&e);
                    tracing::debug!(upstream = %upstream, error = %e, "Unable to update server node");
                    false
                }
            };
            report.upstreamed = Some(sent);
        }

        self.metrics.record_cycle();
        Some(report)
    }

    /// The poll loop. Cycle starts are spaced by the poll interval measured
    /// from the previous start; a cycle that overruns is followed immediately
    /// by the next one. Shutdown is honoured between cycles.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.settings.poll_interval;
        let tick = self.settings.tick;
        let mut next_due = Instant::now();
        tracing::info!(interval_secs = interval.as_secs_f64(), "Poll loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_phase(PollPhase::Idle);

            let now = Instant::now();
            let mut holding = false;
            if now >= next_due {
                if self.grid.is_reloading().await {
                    holding = true;
                    tracing::debug!("Registry reload in progress, holding poll cycle");
                } else {
                    match self.run_cycle().await {
                        Some(report) => {
                            next_due = now + interval;
                            tracing::debug!(
                                probed = report.probed,
                                alive = report.alive,
                                exchanged = report.exchanged,
                                "Poll cycle complete"
                            );
                        }
                        // reload began after the check above
                        None => holding = true,
                    }
                }
            }

            self.set_phase(PollPhase::Sleeping);
            let wait = if holding {
                tick
            } else {
                next_due.saturating_duration_since(Instant::now()).min(tick)
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_phase(PollPhase::Idle);
        tracing::info!("Poll loop stopped");
    }

    /// Re-read the seed list and atomically replace registry and graph.
    ///
    /// The work runs on its own task so a caller that goes away cannot leave
    /// the reload flag set.
    pub async fn reload(&self) -> Result<usize, ReloadError> {
        self.grid.begin_reload().await?;
        tracing::info!(seeds = %self.seeds, "Reloading registry");

        let grid = self.grid.clone();
        let seeds = self.seeds.clone();
        let client = self.client.clone();
        let settings = self.settings.clone();
        let task = tokio::spawn(async move {
            let bootstrapped = load_registry(&client, &seeds, &settings).await;
            grid.finish_reload(bootstrapped).await
        });

        let result = match task.await {
            Ok(result) => result,
            // task panicked before clearing the flag
            Err(e) => {
                self.grid
                    .finish_reload(Err(ConfigError::SeedUnreadable {
                        source_name: self.seeds.to_string(),
                        reason: e.to_string(),
                    }))
                    .await
            }
        };

        match &result {
            Ok(count) => {
                self.metrics.record_reload().await;
                tracing::info!(peers = count, "Registry reloaded");
            }
            Err(e) => tracing::warn!(error = %e, "Registry reload failed, keeping current state"),
        }
        result
    }
}

/// Load the seed list, resolve our address and build a registry. Shared by
/// startup and `/clear`, so an `autodiscover` node is resolved the same way
/// both times.
async fn load_registry(
    client: &PeerClient,
    seeds: &SeedSource,
    settings: &NodeSettings,
) -> Result<NodeRegistry, ConfigError> {
    let list = seeds.load(client).await?;

    let listed = list.gridbugs.iter().any(|b| b.id == settings.node_id);
    let address = match &settings.node_address {
        NodeAddress::Autodiscover if !listed => {
            let lookup = settings
                .ip_lookup_url
                .as_deref()
                .ok_or_else(|| ConfigError::AddressUnresolved(settings.node_id.clone()))?;
            let discovered =
                seed::discover_address(client, lookup, &settings.node_id, settings.listen_port).await?;
            NodeAddress::Fixed(discovered)
        }
        configured => configured.clone(),
    };

    NodeRegistry::bootstrap(&list, &settings.node_id, &address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeColor;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    /// A peer that answers pings and serves a fixed registry
    async fn fake_peer(id: &'static str, knows: Vec<GridBug>) -> String {
        let router = Router::new()
            .route("/ping", get(|| async { Json(serde_json::json!({"status": "OK"})) }))
            .route(
                "/bugs",
                get(move || {
                    let knows = knows.clone();
                    async move {
                        Json(Snapshot {
                            version: 1,
                            gridbugs: knows,
                            node_id: id.into(),
                            node_role: Some("node".into()),
                            node_host: None,
                            node_build: None,
                        })
                    }
                }),
            )
            .route("/post", axum::routing::post(|| async { Json(serde_json::json!({"status": "OK"})) }));
        serve(router).await
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    fn settings(id: &str) -> NodeSettings {
        NodeSettings {
            node_id: id.into(),
            node_address: NodeAddress::Fixed("127.0.0.1:1".into()),
            secret: "grid-key".into(),
            call_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(50),
            tick: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn node_with(id: &str, peers: &[(&str, &str)]) -> GossipNode {
        let list = SeedList {
            version: 1,
            gridbugs: peers
                .iter()
                .map(|(id, host)| GridBug { id: id.to_string(), host: host.to_string(), alive: None })
                .collect(),
        };
        let s = settings(id);
        let registry = NodeRegistry::bootstrap(&list, id, &s.node_address).unwrap();
        GossipNode::new(s, SeedSource::File(PathBuf::from("/nonexistent")), registry)
    }

    fn peer(id: &str, host: &str) -> PeerRecord {
        PeerRecord::new(id, host)
    }

    #[tokio::test]
    async fn probe_classifies_outcomes() {
        let up = fake_peer("b", vec![]).await;
        let failing = serve(Router::new().route(
            "/ping",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let down = closed_port().await;
        let node = node_with("a", &[("a", "127.0.0.1:1")]);

        assert_eq!(node.probe(&peer("b", &up)).await, ProbeOutcome::Alive);
        assert_eq!(node.probe(&peer("c", &failing)).await, ProbeOutcome::Dead(500));
        assert!(matches!(
            node.probe(&peer("d", &down)).await,
            ProbeOutcome::Unreachable(_)
        ));
        assert_eq!(node.metrics.polls(), 3);
    }

    #[tokio::test]
    async fn probe_times_out_on_hung_peer() {
        let hung = serve(Router::new().route(
            "/ping",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let node = node_with("a", &[("a", "127.0.0.1:1")]);
        let started = std::time::Instant::now();
        assert_eq!(
            node.probe(&peer("b", &hung)).await,
            ProbeOutcome::Unreachable(TransportError::Timeout)
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn exchange_merges_pulled_registry() {
        let b = fake_peer(
            "b",
            vec![GridBug { id: "c".into(), host: "h3:8777".into(), alive: Some(false) }],
        )
        .await;
        let node = node_with("a", &[("a", "127.0.0.1:1"), ("b", &b)]);
        let local = node.grid.snapshot().await;
        let epoch = node.grid.epoch().await;

        let outcome = node.exchange(epoch, &peer("b", &b), &local).await;
        assert_eq!(outcome.push, Ok(()));
        assert!(matches!(outcome.pull, PullOutcome::Merged(_)));

        let state = node.grid.read().await;
        assert!(state.registry().contains("c"));
        assert_eq!(state.graph().edge("b", "c").unwrap().color, EdgeColor::Red);
    }

    #[tokio::test]
    async fn exchange_halves_fail_independently() {
        // serves /bugs but has no /post route
        let pull_only = serve(Router::new().route(
            "/bugs",
            get(|| async {
                Json(serde_json::json!({"node_id": "b", "gridbugs": []}))
            }),
        ))
        .await;
        let node = node_with("a", &[("a", "127.0.0.1:1")]);
        let local = node.grid.snapshot().await;

        let outcome = node.exchange(0, &peer("b", &pull_only), &local).await;
        assert!(outcome.push.is_err());
        assert!(matches!(outcome.pull, PullOutcome::Merged(_)));

        let down = closed_port().await;
        let outcome = node.exchange(0, &peer("c", &down), &local).await;
        assert!(outcome.push.is_err());
        assert!(matches!(outcome.pull, PullOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn cycle_probes_gossips_and_reconciles() {
        let b = fake_peer(
            "b",
            vec![GridBug { id: "a".into(), host: "ignored:1".into(), alive: Some(true) }],
        )
        .await;
        let down = closed_port().await;
        let node = node_with("a", &[("a", &down), ("b", &b), ("x", &down)]);

        let report = node.run_cycle().await.unwrap();
        assert_eq!(report.probed, 3);
        assert_eq!(report.alive, 1);
        assert_eq!(report.exchanged, 1);
        assert!(report.reconciled);
        assert_eq!(report.upstreamed, None);

        let state = node.grid.read().await;
        assert_eq!(state.registry().get("b").unwrap().last_known_alive, Some(true));
        assert_eq!(state.registry().get("x").unwrap().last_known_alive, Some(false));
        assert_eq!(state.graph().edge("a", "b").unwrap().color, EdgeColor::Green);
        assert_eq!(state.graph().edge("a", "x").unwrap().color, EdgeColor::Red);
        assert_eq!(state.graph().edge("b", "a").unwrap().color, EdgeColor::Green);
        drop(state);
        assert_eq!(node.metrics.cycles(), 1);
    }

    #[tokio::test]
    async fn cycle_is_skipped_during_reload() {
        let node = node_with("a", &[("a", "127.0.0.1:1")]);
        node.grid.begin_reload().await.unwrap();
        assert!(node.run_cycle().await.is_none());
        assert_eq!(node.metrics.polls(), 0);
    }

    #[tokio::test]
    async fn reload_failure_keeps_registry() {
        let node = node_with("a", &[("a", "127.0.0.1:1")]);
        node.grid.add_peer("h2:8777", "b").await;
        let err = node.reload().await.unwrap_err();
        assert!(matches!(err, ReloadError::Config(ConfigError::SeedUnreadable { .. })));
        assert!(!node.grid.is_reloading().await);
        assert_eq!(node.grid.snapshot().await.gridbugs.len(), 2);
    }

    #[tokio::test]
    async fn reload_rediscovers_address_when_dropped_from_seed_list() {
        let lookup = serve(Router::new().route("/", get(|| async { "127.0.0.1\n" }))).await;
        let path = std::env::temp_dir().join(format!("gridbug-reload-{}.json", std::process::id()));
        let write_seeds = |entries: serde_json::Value| {
            std::fs::write(&path, serde_json::json!({"version": 1, "gridbugs": entries}).to_string())
                .unwrap();
        };
        write_seeds(serde_json::json!([
            {"id": "a", "host": "h1:8777"},
            {"id": "b", "host": "h2:8777"}
        ]));

        let settings = NodeSettings {
            node_id: "a".into(),
            node_address: NodeAddress::Autodiscover,
            secret: "grid-key".into(),
            call_timeout: Duration::from_millis(500),
            ip_lookup_url: Some(format!("http://{lookup}/")),
            ..Default::default()
        };
        let node = GossipNode::bootstrap(settings, SeedSource::File(path.clone()))
            .await
            .unwrap();
        assert_eq!(node.grid.read().await.registry().self_address(), "h1:8777");

        write_seeds(serde_json::json!([{"id": "b", "host": "h2:8777"}]));
        assert_eq!(node.reload().await, Ok(2));

        let state = node.grid.read().await;
        assert_eq!(state.registry().self_address(), "127.0.0.1:8777");
        assert_eq!(state.registry().get("a").unwrap().address, "127.0.0.1:8777");
        drop(state);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn hung_peers_do_not_stall_the_cycle() {
        let hung = serve(Router::new().route(
            "/ping",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let b = fake_peer("b", vec![]).await;
        let mut s = settings("a");
        s.call_timeout = Duration::from_millis(400);
        let peers = [
            ("a", b.as_str()),
            ("b", b.as_str()),
            ("h1", hung.as_str()),
            ("h2", hung.as_str()),
            ("h3", hung.as_str()),
            ("h4", hung.as_str()),
        ];
        let list = SeedList {
            version: 1,
            gridbugs: peers
                .iter()
                .map(|(id, host)| GridBug { id: id.to_string(), host: host.to_string(), alive: None })
                .collect(),
        };
        s.node_address = NodeAddress::Fixed(b.clone());
        let registry = NodeRegistry::bootstrap(&list, "a", &s.node_address).unwrap();
        let node = GossipNode::new(s, SeedSource::File(PathBuf::from("/nonexistent")), registry);

        let started = std::time::Instant::now();
        let report = node.run_cycle().await.unwrap();
        // four hung peers probed one after another would take 1.6s
        assert!(started.elapsed() < Duration::from_millis(1200), "took {:?}", started.elapsed());
        assert_eq!(report.probed, 6);
        assert_eq!(report.alive, 2);
        assert_eq!(report.exchanged, 1);
        assert_eq!(node.metrics.polls(), 6);
    }

    #[tokio::test]
    async fn run_holds_during_reload_then_resumes() {
        let down = closed_port().await;
        let mut s = settings("a");
        s.poll_interval = Duration::from_secs(30);
        let list = SeedList {
            version: 1,
            gridbugs: vec![GridBug { id: "a".into(), host: down.clone(), alive: None }],
        };
        let registry = NodeRegistry::bootstrap(&list, "a", &s.node_address).unwrap();
        let node = Arc::new(GossipNode::new(
            s.clone(),
            SeedSource::File(PathBuf::from("/nonexistent")),
            registry,
        ));

        node.grid.begin_reload().await.unwrap();
        let (tx, rx) = watch::channel(false);
        let runner = node.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(matches!(node.phase(), PollPhase::Idle | PollPhase::Sleeping));
            assert_eq!(node.metrics.cycles(), 0);
        }
        assert_eq!(node.metrics.polls(), 0);

        let fresh = NodeRegistry::bootstrap(&list, "a", &s.node_address).unwrap();
        node.grid.finish_reload(Ok(fresh)).await.unwrap();

        // the held cycle starts within a tick, not a full interval later
        tokio::time::timeout(Duration::from_secs(2), async {
            while node.metrics.cycles() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("poll loop should resume after the reload");

        // next start is one interval after this one
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(node.metrics.cycles(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poll loop should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let down = closed_port().await;
        let node = Arc::new(node_with("a", &[("a", &down)]));
        let (tx, rx) = watch::channel(false);

        let runner = node.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        let mut phases = node.subscribe_phase();
        tokio::time::timeout(Duration::from_secs(5), async {
            while node.metrics.cycles() < 2 {
                let _ = phases.changed().await;
            }
        })
        .await
        .expect("poll loop should complete cycles");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poll loop should stop")
            .unwrap();
        assert_eq!(node.phase(), PollPhase::Idle);
    }
}
