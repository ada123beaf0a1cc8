//! Gridbug protocol
//!
//! A fixed set of cooperating nodes probe each other, gossip their peer
//! registries, and converge on a shared connectivity graph any node can serve.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────┐  ping / push / pull  ┌──────┐
//!  │Node A│◄────────────────────►│Node B│
//!  └──┬───┘                      └──┬───┘
//!     │ upstream push               │
//!     ▼                             ▼
//!  ┌──────────────────────────────────────┐
//!  │        server node (optional)        │
//!  └──────────────────────────────────────┘
//! ```
//!
//! ## Poll cycle
//! - Probe every registry entry (`GET /ping`) and record liveness
//! - Push our registry to every live peer and pull theirs (`POST /post`, `GET /bugs`)
//! - Fold our own probe results into the graph under our id
//! - Push the registry to the upstream node, if one is configured
//!
//! ## Graph merge
//! - Only the reporting source may update edges it owns (`source → *`)
//! - Every merge grays out edges older than the TTL
//! - Peers mentioned in any report are added to the registry

pub mod client;
pub mod error;
pub mod gossip;
pub mod graph;
pub mod grid;
mod ingress;
pub mod metrics;
pub mod peer;
pub mod seed;
pub mod types;

pub use client::{PeerClient, ProbeOutcome};
pub use error::*;
pub use gossip::{GossipNode, PollPhase};
pub use graph::{ConnectivityGraph, EdgeColor, GraphEdge};
pub use grid::{Grid, GridState, MergeSummary};
pub use metrics::{Metrics, StatsReport};
pub use peer::{NodeRegistry, PeerRecord};
pub use seed::SeedSource;
pub use types::*;
