use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::client::PeerClient;
use crate::error::ConfigError;
use crate::types::SeedList;

/// Where the seed list comes from. A URL wins over a local file when both
/// are configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedSource {
    File(PathBuf),
    Url(String),
}

impl fmt::Display for SeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedSource::File(path) => write!(f, "{}", path.display()),
            SeedSource::Url(url) => f.write_str(url),
        }
    }
}

impl SeedSource {
    pub async fn load(&self, client: &PeerClient) -> Result<SeedList, ConfigError> {
        let unreadable = |reason: String| ConfigError::SeedUnreadable {
            source_name: self.to_string(),
            reason,
        };
        let seeds: SeedList = match self {
            SeedSource::File(path) => {
                let data = tokio::fs::read(path).await.map_err(|e| unreadable(e.to_string()))?;
                serde_json::from_slice(&data).map_err(|e| unreadable(e.to_string()))?
            }
            SeedSource::Url(url) => {
                client.get_json(url).await.map_err(|e| unreadable(e.to_string()))?
            }
        };
        tracing::info!(
            source = %self,
            bugs = seeds.gridbugs.len(),
            version = seeds.version,
            "Loaded seed list"
        );
        Ok(seeds)
    }
}

/// Ask an IP lookup service for our public address and pair it with the
/// API port.
pub async fn discover_address(
    client: &PeerClient,
    lookup_url: &str,
    node_id: &str,
    port: u16,
) -> Result<String, ConfigError> {
    let body = client.get_text(lookup_url).await.map_err(|e| {
        tracing::warn!(url = %lookup_url, error = %e, "IP lookup failed");
        ConfigError::AddressUnresolved(node_id.to_string())
    })?;
    let ip: IpAddr = body.trim().parse().map_err(|_| {
        tracing::warn!(url = %lookup_url, body = %body.trim(), "IP lookup returned garbage");
        ConfigError::AddressUnresolved(node_id.to_string())
    })?;
    let address = match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    };
    tracing::info!(address = %address, "Autodiscovered public address");
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("gridbug-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn loads_seed_file() {
        let path = temp_file(
            "seeds.json",
            r#"{"version": 2, "gridbugs": [{"id": "a", "host": "h1:8777"}]}"#,
        );
        let client = PeerClient::new("k", Duration::from_secs(1));
        let seeds = SeedSource::File(path.clone()).load(&client).await.unwrap();
        assert_eq!(seeds.version, 2);
        assert_eq!(seeds.gridbugs[0].id, "a");
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn missing_or_broken_seed_file_is_config_error() {
        let client = PeerClient::new("k", Duration::from_secs(1));
        let missing = SeedSource::File("/nonexistent/gridbugs.json".into());
        assert!(matches!(
            missing.load(&client).await,
            Err(ConfigError::SeedUnreadable { .. })
        ));

        let path = temp_file("broken.json", r#"{"gridbugs": "#);
        let broken = SeedSource::File(path.clone());
        assert!(matches!(
            broken.load(&client).await,
            Err(ConfigError::SeedUnreadable { .. })
        ));
        std::fs::remove_file(path).ok();
    }
}
