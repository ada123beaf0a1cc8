//! Connectivity graph: directed edges `source → target` carrying the most
//! recent reachability report of `source` about `target`.
//!
//! Two passes run on every merge:
//! - the authoritative pass, which creates or updates only edges owned by
//!   the reporting source;
//! - the decay pass, which forces every edge not refreshed within the TTL to
//!   gray while leaving its `alive` value alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeColor {
    Green,
    Red,
    Gray,
}

impl EdgeColor {
    pub fn from_alive(alive: Option<bool>) -> Self {
        match alive {
            Some(true) => EdgeColor::Green,
            Some(false) => EdgeColor::Red,
            None => EdgeColor::Gray,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// `source.target`, for display only
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub alive: Option<bool>,
    pub color: EdgeColor,
    pub last_updated: DateTime<Utc>,
}

impl GraphEdge {
    pub fn key(source: &str, target: &str) -> String {
        format!("{source}.{target}")
    }

    fn is_stale(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_updated) > ttl
    }
}

/// What the authoritative pass did for one report entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeUpdate {
    Created,
    Updated,
}

/// Graph as served by `/raw`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawGraph {
    pub nodes: Vec<NodeId>,
    pub edges: Vec<GraphEdge>,
}

/// Graph as served by `/graph`, in the element layout graph viewers expect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphElements {
    pub nodes: Vec<Element<NodeData>>,
    pub edges: Vec<Element<GraphEdge>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub id: NodeId,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectivityGraph {
    nodes: Vec<NodeId>,
    // Keyed by the pair, so at most one edge per (source, target) and ids
    // containing dots cannot collide.
    edges: BTreeMap<(NodeId, NodeId), GraphEdge>,
}

impl ConnectivityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_node(&mut self, id: &str) {
        if !self.nodes.iter().any(|n| n == id) {
            self.nodes.push(id.to_string());
        }
    }

    /// Authoritative pass for one entry: `source` asserts its view of `target`.
    pub fn report(
        &mut self,
        source: &str,
        target: &str,
        alive: Option<bool>,
        now: DateTime<Utc>,
    ) -> EdgeUpdate {
        self.ensure_node(source);
        self.ensure_node(target);

        match self.edges.entry((source.to_string(), target.to_string())) {
            Entry::Occupied(mut slot) => {
                let edge = slot.get_mut();
                debug_assert_eq!(edge.source, source);
                edge.alive = alive;
                edge.color = EdgeColor::from_alive(alive);
                edge.last_updated = now;
                EdgeUpdate::Updated
            }
            Entry::Vacant(slot) => {
                slot.insert(GraphEdge {
                    id: GraphEdge::key(source, target),
                    source: source.to_string(),
                    target: target.to_string(),
                    alive,
                    color: EdgeColor::from_alive(alive),
                    last_updated: now,
                });
                EdgeUpdate::Created
            }
        }
    }

    /// Decay pass: gray out every edge older than `ttl`. Returns how many
    /// edges changed color.
    pub fn decay(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut grayed = 0;
        for edge in self.edges.values_mut() {
            if edge.color != EdgeColor::Gray && edge.is_stale(now, ttl) {
                edge.color = EdgeColor::Gray;
                grayed += 1;
            }
        }
        grayed
    }

    /// Apply a validated report: authoritative pass over every entry, then
    /// one decay pass over the whole graph.
    pub fn apply_report(&mut self, report: &Snapshot, now: DateTime<Utc>, ttl: Duration) -> usize {
        let source = report.node_id.as_str();
        for bug in &report.gridbugs {
            self.report(source, &bug.id, bug.alive, now);
        }
        self.decay(now, ttl)
    }

    pub fn edge(&self, source: &str, target: &str) -> Option<&GraphEdge> {
        self.edges.get(&(source.to_string(), target.to_string()))
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.values()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn raw(&self) -> RawGraph {
        RawGraph {
            nodes: self.nodes.clone(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    pub fn elements(&self) -> GraphElements {
        GraphElements {
            nodes: self
                .nodes
                .iter()
                .map(|id| Element { data: NodeData { id: id.clone() } })
                .collect(),
            edges: self.edges.values().map(|e| Element { data: e.clone() }).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TTL: Duration = Duration::from_secs(30);

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn color_follows_alive() {
        let mut g = ConnectivityGraph::new();
        g.report("a", "b", Some(true), t(0));
        g.report("a", "c", Some(false), t(0));
        g.report("a", "d", None, t(0));
        assert_eq!(g.edge("a", "b").unwrap().color, EdgeColor::Green);
        assert_eq!(g.edge("a", "c").unwrap().color, EdgeColor::Red);
        assert_eq!(g.edge("a", "d").unwrap().color, EdgeColor::Gray);
        assert_eq!(g.nodes(), &["a", "b", "c", "d"]);
    }

    #[test]
    fn repeated_reports_update_in_place() {
        let mut g = ConnectivityGraph::new();
        assert_eq!(g.report("a", "b", Some(true), t(0)), EdgeUpdate::Created);
        assert_eq!(g.report("a", "b", Some(false), t(5)), EdgeUpdate::Updated);
        assert_eq!(g.edge_count(), 1);
        let edge = g.edge("a", "b").unwrap();
        assert_eq!(edge.id, "a.b");
        assert_eq!(edge.color, EdgeColor::Red);
        assert_eq!(edge.last_updated, t(5));
    }

    #[test]
    fn dotted_ids_do_not_collide() {
        let mut g = ConnectivityGraph::new();
        g.report("a.b", "c", Some(true), t(0));
        g.report("a", "b.c", Some(false), t(0));
        assert_eq!(g.edge_count(), 2);
        assert_eq!(g.edge("a.b", "c").unwrap().alive, Some(true));
        assert_eq!(g.edge("a", "b.c").unwrap().alive, Some(false));
    }

    #[test]
    fn decay_grays_stale_edges_and_keeps_alive() {
        let mut g = ConnectivityGraph::new();
        g.report("a", "b", Some(true), t(0));
        g.report("c", "d", Some(false), t(90));

        assert_eq!(g.decay(t(30), TTL), 0, "exactly TTL old is not stale");
        assert_eq!(g.decay(t(100), TTL), 1);

        let ab = g.edge("a", "b").unwrap();
        assert_eq!(ab.color, EdgeColor::Gray);
        assert_eq!(ab.alive, Some(true));
        assert_eq!(g.edge("c", "d").unwrap().color, EdgeColor::Red);

        // stays gray on every later pass
        assert_eq!(g.decay(t(200), TTL), 1, "c.d ages out now");
        assert_eq!(g.edge("a", "b").unwrap().color, EdgeColor::Gray);
    }

    #[test]
    fn fresh_report_revives_grayed_edge() {
        let mut g = ConnectivityGraph::new();
        g.report("a", "b", Some(true), t(0));
        g.decay(t(100), TTL);
        g.report("a", "b", Some(true), t(101));
        assert_eq!(g.edge("a", "b").unwrap().color, EdgeColor::Green);
    }

    #[test]
    fn element_projection() {
        let mut g = ConnectivityGraph::new();
        g.report("a", "b", Some(true), t(0));
        let json = serde_json::to_value(g.elements()).unwrap();
        assert_eq!(json["nodes"][0]["data"]["id"], "a");
        assert_eq!(json["edges"][0]["data"]["id"], "a.b");
        assert_eq!(json["edges"][0]["data"]["color"], "green");

        let raw = serde_json::to_value(g.raw()).unwrap();
        assert_eq!(raw["nodes"], serde_json::json!(["a", "b"]));
        assert_eq!(raw["edges"][0]["source"], "a");
    }
}
