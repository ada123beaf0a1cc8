use serde::{Deserialize, Serialize};

/// Response extension set by handlers that answer with a success status but
/// still count as a failed request (silently dropped or invalid gossip).
#[derive(Debug, Clone, Copy)]
pub struct RequestFailed;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeReport {
    pub local_time: String,
    pub utc: String,
    /// Seconds since the epoch, with fraction
    pub ts: f64,
    pub uptime_secs: i64,
}
