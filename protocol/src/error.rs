use thiserror::Error;

/// Fatal configuration problems. A node refuses to serve while any of these
/// is outstanding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("node id is missing")]
    MissingIdentity,

    #[error("shared grid key is missing")]
    MissingSecret,

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("seed list is empty")]
    EmptySeedList,

    #[error("duplicate id in seed list: {0} (ids must be unique)")]
    DuplicateId(String),

    #[error("unable to load seed list from {source_name}: {reason}")]
    SeedUnreadable { source_name: String, reason: String },

    #[error("address for {0} is set to autodiscover but could not be resolved")]
    AddressUnresolved(String),
}

/// Failures talking to a peer. Always recoverable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,

    #[error("peer returned HTTP {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(String),

    #[error("unable to decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Request(e.to_string())
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("malformed report: {0}")]
    Malformed(String),
}

/// Reasons an inbound gossip push was not merged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngressError {
    #[error("unauthorized gossip push")]
    Unauthorized,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("registry reload in progress")]
    Busy,

    #[error(transparent)]
    Merge(#[from] MergeError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReloadError {
    #[error("registry reload already in progress")]
    Busy,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
