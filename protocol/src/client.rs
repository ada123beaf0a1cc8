use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

use crate::error::TransportError;
use crate::types::Snapshot;

/// Result of a liveness probe. Failure to connect is an expected outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive,
    /// Peer answered with a non-success status
    Dead(u16),
    Unreachable(TransportError),
}

impl ProbeOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProbeOutcome::Alive)
    }
}

/// HTTP client for talking to other nodes. Every call is bounded by the
/// configured timeout, including reading the response body.
#[derive(Debug, Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    secret: String,
    timeout: Duration,
}

impl PeerClient {
    pub fn new(secret: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret: secret.into(),
            timeout,
        }
    }

    fn url(host: &str, path: &str) -> String {
        format!("http://{host}{path}")
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("key", &self.secret)
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// `GET /ping`
    pub async fn probe(&self, host: &str) -> ProbeOutcome {
        let url = Self::url(host, "/ping");
        let result = self
            .bounded(async {
                let resp = self.http.get(&url).send().await?;
                Ok::<_, TransportError>(resp.status())
            })
            .await;
        match result {
            Ok(status) if status.is_success() => ProbeOutcome::Alive,
            Ok(status) => ProbeOutcome::Dead(status.as_u16()),
            Err(e) => ProbeOutcome::Unreachable(e),
        }
    }

    /// `POST /post` with our snapshot
    pub async fn push(&self, host: &str, snapshot: &Snapshot) -> Result<(), TransportError> {
        let url = Self::url(host, "/post");
        self.bounded(async {
            let resp = self.auth(self.http.post(&url)).json(snapshot).send().await?;
            if !resp.status().is_success() {
                return Err(TransportError::Status(resp.status().as_u16()));
            }
            Ok::<_, TransportError>(())
        })
        .await
    }

    /// `GET /bugs`
    pub async fn pull(&self, host: &str) -> Result<Snapshot, TransportError> {
        self.get_json(&Self::url(host, "/bugs")).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, TransportError> {
        self.bounded(async {
            let resp = self.http.get(url).send().await?;
            if !resp.status().is_success() {
                return Err(TransportError::Status(resp.status().as_u16()));
            }
            let bytes = resp.bytes().await?;
            serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
        })
        .await
    }

    pub async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        self.bounded(async {
            let resp = self.http.get(url).send().await?;
            if !resp.status().is_success() {
                return Err(TransportError::Status(resp.status().as_u16()));
            }
            Ok::<_, TransportError>(resp.text().await?)
        })
        .await
    }
}
