use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use gridbug_protocol::{NodeAddress, NodeRole, NodeSettings, SeedSource};

#[derive(Parser, Debug)]
#[command(name = "gridbug", about = "Peer-to-peer network health monitor", version)]
pub struct Cli {
    /// Unique id of this node (e.g. cloud-1)
    #[arg(long, env = "GRIDBUG_ID")]
    pub id: String,

    /// Address other nodes reach us at (host:port), or "autodiscover"
    #[arg(long, env = "GRIDBUG_HOST", default_value = "autodiscover")]
    pub host: NodeAddress,

    /// server or node
    #[arg(long, env = "GRIDBUG_ROLE", default_value = "node")]
    pub role: NodeRole,

    /// Node that receives our registry after every poll cycle (host:port)
    #[arg(long, env = "GRIDBUG_SERVERNODE")]
    pub server_node: Option<String>,

    /// Shared grid key
    #[arg(long, env = "GRIDBUG_KEY", hide_env_values = true)]
    pub key: String,

    /// API port
    #[arg(long, env = "GRIDBUG_PORT", default_value = "8777")]
    pub port: u16,

    /// Seconds between poll cycles
    #[arg(long, env = "GRIDBUG_WAIT", default_value = "10")]
    pub wait: u64,

    /// Seconds before an edge without fresh reports turns gray
    #[arg(long, env = "GRIDBUG_TTL", default_value = "30")]
    pub ttl: u64,

    /// Timeout for every outbound call, in seconds
    #[arg(long, env = "GRIDBUG_TIMEOUT", default_value = "5")]
    pub timeout: u64,

    /// Largest accepted gossip payload, in bytes
    #[arg(long, env = "GRIDBUG_MAX_PAYLOAD", default_value = "2000")]
    pub max_payload: usize,

    /// Concurrent probes and exchanges per cycle
    #[arg(long, env = "GRIDBUG_FANOUT", default_value = "8")]
    pub fanout: usize,

    /// Seed list file
    #[arg(long, env = "GRIDBUGLIST", default_value = "gridbugs.json")]
    pub seeds: PathBuf,

    /// Seed list URL (overrides --seeds)
    #[arg(long, env = "BUGLISTURL")]
    pub seeds_url: Option<String>,

    /// Service returning our public IP, used with --host autodiscover
    #[arg(long, env = "GRIDBUG_IP_LOOKUP", default_value = "https://api.ipify.org")]
    pub ip_lookup_url: String,

    /// Verbose logging
    #[arg(long, env = "GRIDBUG_DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Cli {
    pub fn seed_source(&self) -> SeedSource {
        match self.seeds_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => SeedSource::Url(url.to_string()),
            _ => SeedSource::File(self.seeds.clone()),
        }
    }

    pub fn settings(&self) -> NodeSettings {
        let poll_interval = Duration::from_secs(self.wait);
        NodeSettings {
            node_id: self.id.trim().to_string(),
            node_address: self.host.clone(),
            role: self.role,
            upstream: self.server_node.clone().filter(|s| !s.trim().is_empty()),
            secret: self.key.clone(),
            poll_interval,
            edge_ttl: Duration::from_secs(self.ttl),
            call_timeout: Duration::from_secs(self.timeout),
            max_payload_bytes: self.max_payload,
            listen_port: self.port,
            fanout: self.fanout,
            tick: Duration::from_secs(1).min(poll_interval),
            ip_lookup_url: Some(self.ip_lookup_url.clone()),
        }
    }
}
