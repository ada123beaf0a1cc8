use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, MergeError};

/// Unique node identifier
pub type NodeId = String;

/// Build string advertised in snapshots and stats
pub const BUILD: &str = env!("CARGO_PKG_VERSION");

/// One entry of a registry snapshot: a peer and, if we have probed it,
/// whether it answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridBug {
    pub id: NodeId,
    /// `host:port` of the peer's API listener
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive: Option<bool>,
}

/// Full registry snapshot, tagged with the node that produced it.
///
/// This is what `/bugs` serves, what a gossip push carries, and what the
/// graph merge consumes as a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub version: u64,
    pub gridbugs: Vec<GridBug>,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_build: Option<String>,
}

impl Snapshot {
    /// Reject reports that are missing required fields. Checked before any
    /// state is touched so a bad report never half-applies.
    pub fn validate(&self) -> Result<(), MergeError> {
        if self.node_id.trim().is_empty() {
            return Err(MergeError::Malformed("node_id is empty".into()));
        }
        if let Some(host) = &self.node_host {
            if host.trim().is_empty() {
                return Err(MergeError::Malformed("node_host is empty".into()));
            }
        }
        for (i, bug) in self.gridbugs.iter().enumerate() {
            if bug.id.trim().is_empty() {
                return Err(MergeError::Malformed(format!("gridbugs[{i}].id is empty")));
            }
            if bug.host.trim().is_empty() {
                return Err(MergeError::Malformed(format!("gridbugs[{i}].host is empty")));
            }
        }
        Ok(())
    }

    /// Parse a report received over the wire.
    pub fn from_slice(body: &[u8]) -> Result<Self, MergeError> {
        let snapshot: Snapshot =
            serde_json::from_slice(body).map_err(|e| MergeError::Malformed(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// The `gridbugs.json` seed list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedList {
    #[serde(default)]
    pub version: u64,
    pub gridbugs: Vec<GridBug>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Server,
    Node,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Server => f.write_str("server"),
            NodeRole::Node => f.write_str("node"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(NodeRole::Server),
            "node" => Ok(NodeRole::Node),
            other => Err(format!("unknown role {other:?} (expected server or node)")),
        }
    }
}

/// Where this node can be reached. `Autodiscover` defers to the seed list
/// entry for our id, or to a public IP lookup when we are not listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAddress {
    Fixed(String),
    Autodiscover,
}

impl FromStr for NodeAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("autodiscover") {
            Ok(NodeAddress::Autodiscover)
        } else if s.is_empty() {
            Err("address is empty".into())
        } else {
            Ok(NodeAddress::Fixed(s.to_string()))
        }
    }
}

/// Immutable settings handed to the core at startup
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// This node's unique ID
    pub node_id: NodeId,
    /// Address other nodes reach our API at (e.g. "myhost.com:8777")
    pub node_address: NodeAddress,
    pub role: NodeRole,
    /// Node that receives our full registry after every cycle
    pub upstream: Option<String>,
    /// Shared grid key sent as the `key` header on gossip pushes
    pub secret: String,
    /// Time between poll cycle starts
    pub poll_interval: Duration,
    /// Age after which an edge is forced to gray
    pub edge_ttl: Duration,
    /// Timeout applied to every outbound call
    pub call_timeout: Duration,
    /// Largest accepted `/post` body
    pub max_payload_bytes: usize,
    pub listen_port: u16,
    /// Concurrent probes/exchanges per cycle
    pub fanout: usize,
    /// Scheduler wake-up granularity
    pub tick: Duration,
    /// Service answering with our public IP, used for `autodiscover`
    pub ip_lookup_url: Option<String>,
}

impl NodeSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        let non_zero = [
            ("poll_interval", self.poll_interval),
            ("edge_ttl", self.edge_ttl),
            ("call_timeout", self.call_timeout),
            ("tick", self.tick),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::InvalidSetting { name, reason: "must be non-zero".into() });
            }
        }
        if self.fanout == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "fanout",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: "localhost".into(),
            node_address: NodeAddress::Autodiscover,
            role: NodeRole::Node,
            upstream: None,
            secret: String::new(),
            poll_interval: Duration::from_secs(10),
            edge_ttl: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
            max_payload_bytes: 2000,
            listen_port: 8777,
            fanout: 8,
            tick: Duration::from_secs(1),
            ip_lookup_url: None,
        }
    }
}
