use crate::error::Result;
use crate::health::LabelPair;
use crate::store::ResourceStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::sync::Arc;

/// Whether the node currently holding a volume may be displaced.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait HolderHealth: Send + Sync {
    /// True once the health watcher has fenced `node`.
    async fn is_fenced(&self, node: &str) -> Result<bool>;
}

/// Reads the fenced marker label from the `Node` object.
pub struct NodeLabelHealth {
    nodes: Arc<dyn ResourceStore<Node>>,
    fenced: LabelPair,
}

impl NodeLabelHealth {
    pub fn new(nodes: Arc<dyn ResourceStore<Node>>, fenced: LabelPair) -> Self {
        Self { nodes, fenced }
    }
}

#[async_trait]
impl HolderHealth for NodeLabelHealth {
    async fn is_fenced(&self, node: &str) -> Result<bool> {
        Ok(self
            .nodes
            .get(node)
            .await?
            .is_some_and(|n| n.metadata.labels.as_ref().is_some_and(|l| self.fenced.is_set(l))))
    }
}
