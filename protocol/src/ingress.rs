//! Inbound side of gossip: a peer pushing its registry to us.

use crate::error::IngressError;
use crate::gossip::GossipNode;
use crate::grid::MergeSummary;
use crate::types::Snapshot;

impl GossipNode {
    /// Reject a body before reading it if its declared length is too big
    pub fn check_size(&self, size: usize) -> Result<(), IngressError> {
        let max = self.settings.max_payload_bytes;
        if size > max {
            self.metrics.record_oversize();
            tracing::warn!(size, max, "Rejected heavy gossip payload");
            return Err(IngressError::PayloadTooLarge { size, max });
        }
        Ok(())
    }

    pub fn authorize(&self, key: Option<&str>) -> Result<(), IngressError> {
        match key {
            Some(k) if k == self.settings.secret => Ok(()),
            _ => {
                self.metrics.record_unauthorized();
                tracing::warn!(key_present = key.is_some(), "Unauthorized gossip push dropped");
                Err(IngressError::Unauthorized)
            }
        }
    }

    /// Authenticate, size-check, parse and merge a pushed registry. Nothing
    /// is parsed before auth and size pass, and nothing is written unless
    /// the whole payload is valid.
    pub async fn ingest(&self, key: Option<&str>, body: &[u8]) -> Result<MergeSummary, IngressError> {
        self.authorize(key)?;
        self.check_size(body.len())?;

        if self.grid.is_reloading().await {
            self.metrics.record_busy();
            return Err(IngressError::Busy);
        }

        let report = Snapshot::from_slice(body).map_err(|e| {
            tracing::warn!(error = %e, "Invalid gossip payload");
            IngressError::from(e)
        })?;

        let result = self.grid.merge_inbound(&report).await;
        match &result {
            Ok(summary) => tracing::debug!(
                source = %report.node_id,
                entries = summary.entries,
                discovered = summary.discovered,
                "Merged pushed registry"
            ),
            Err(IngressError::Busy) => self.metrics.record_busy(),
            Err(e) => tracing::warn!(source = %report.node_id, error = %e, "Pushed registry not merged"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MergeError;
    use crate::graph::EdgeColor;
    use crate::peer::NodeRegistry;
    use crate::seed::SeedSource;
    use crate::types::*;

    fn node() -> GossipNode {
        let list = SeedList {
            version: 1,
            gridbugs: vec![
                GridBug { id: "a".into(), host: "h1:8777".into(), alive: None },
                GridBug { id: "b".into(), host: "h2:8777".into(), alive: None },
            ],
        };
        let settings = NodeSettings {
            node_id: "a".into(),
            secret: "grid-key".into(),
            max_payload_bytes: 200,
            ..Default::default()
        };
        let registry = NodeRegistry::bootstrap(&list, "a", &settings.node_address).unwrap();
        GossipNode::new(settings, SeedSource::File("gridbugs.json".into()), registry)
    }

    const PAYLOAD: &[u8] =
        br#"{"node_id": "b", "node_host": "h2:8777", "gridbugs": [{"id": "c", "host": "h3:8777", "alive": true}]}"#;

    async fn unchanged(node: &GossipNode) -> bool {
        let state = node.grid.read().await;
        state.registry().len() == 2 && state.graph().is_empty()
    }

    #[tokio::test]
    async fn accepted_push_is_merged() {
        let node = node();
        let summary = node.ingest(Some("grid-key"), PAYLOAD).await.unwrap();
        assert_eq!(summary.discovered, 1);

        let state = node.grid.read().await;
        assert!(state.registry().contains("c"));
        assert_eq!(state.graph().edge("b", "c").unwrap().color, EdgeColor::Green);
    }

    #[tokio::test]
    async fn wrong_or_missing_key_never_mutates() {
        let node = node();
        let payloads: [&[u8]; 3] = [PAYLOAD, b"garbage", br#"{"node_id": "", "gridbugs": []}"#];
        for body in payloads {
            for key in [None, Some(""), Some("wrong"), Some("grid-key ")] {
                assert_eq!(node.ingest(key, body).await, Err(IngressError::Unauthorized));
            }
        }
        assert!(unchanged(&node).await);
        assert_eq!(node.metrics.unauthorized(), 12);
    }

    #[tokio::test]
    async fn oversize_body_is_rejected_before_parsing() {
        let node = node();
        let mut big = PAYLOAD.to_vec();
        big.extend(std::iter::repeat(b' ').take(300));
        assert_eq!(
            node.ingest(Some("grid-key"), &big).await,
            Err(IngressError::PayloadTooLarge { size: big.len(), max: 200 })
        );
        // not even valid JSON, still a size error rather than a parse error
        let junk = vec![b'x'; 201];
        assert!(matches!(
            node.ingest(Some("grid-key"), &junk).await,
            Err(IngressError::PayloadTooLarge { .. })
        ));
        assert!(unchanged(&node).await);
    }

    #[tokio::test]
    async fn malformed_payload_leaves_graph_alone() {
        let node = node();
        let err = node
            .ingest(Some("grid-key"), br#"{"node_id": "b", "gridbugs": [{"id": "c"}]}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, IngressError::Merge(MergeError::Malformed(_))));
        assert!(unchanged(&node).await);
    }

    #[tokio::test]
    async fn push_during_reload_is_busy() {
        let node = node();
        node.grid.begin_reload().await.unwrap();
        assert_eq!(node.ingest(Some("grid-key"), PAYLOAD).await, Err(IngressError::Busy));
        assert!(unchanged(&node).await);
    }
}
