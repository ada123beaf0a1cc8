use std::sync::Arc;

use gridbug_protocol::GossipNode;

pub struct AppState {
    pub node: Arc<GossipNode>,
}

impl AppState {
    pub fn new(node: GossipNode) -> Arc<Self> {
        Arc::new(Self { node: Arc::new(node) })
    }
}
