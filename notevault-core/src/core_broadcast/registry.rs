//! Concurrent map from node id to node handle
//!
//! Owned and passed in explicitly; there is no process-wide registry.
//! Entries are managed by whoever owns the node lifecycles. The broadcaster
//! only reads.

use super::node::{NodeHandle, NodeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<NodeId, Arc<dyn NodeHandle>>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &NodeId) -> Option<Arc<dyn NodeHandle>> {
        self.nodes.read().await.get(id).cloned()
    }

    /// Register `handle` under `id`, returning the handle it displaced
    pub async fn insert(
        &self,
        id: NodeId,
        handle: Arc<dyn NodeHandle>,
    ) -> Option<Arc<dyn NodeHandle>> {
        debug!(node = %id, "Registering node");
        self.nodes.write().await.insert(id, handle)
    }

    pub async fn remove(&self, id: &NodeId) -> Option<Arc<dyn NodeHandle>> {
        debug!(node = %id, "Unregistering node");
        self.nodes.write().await.remove(id)
    }

    pub async fn contains(&self, id: &NodeId) -> bool {
        self.nodes.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Registered ids, sorted
    pub async fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_broadcast::node::EchoNode;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = NodeRegistry::new();
        assert!(registry.is_empty().await);

        let id = NodeId::from("a");
        assert!(registry.insert(id.clone(), Arc::new(EchoNode)).await.is_none());
        assert!(registry.contains(&id).await);
        assert!(registry.get(&id).await.is_some());

        // Re-registering hands back the previous handle
        assert!(registry.insert(id.clone(), Arc::new(EchoNode)).await.is_some());
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove(&id).await.is_some());
        assert!(registry.get(&id).await.is_none());
        assert!(registry.remove(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let registry = NodeRegistry::new();
        let other = registry.clone();

        other.insert(NodeId::from("b"), Arc::new(EchoNode)).await;
        other.insert(NodeId::from("a"), Arc::new(EchoNode)).await;

        assert_eq!(registry.ids().await, vec![NodeId::from("a"), NodeId::from("b")]);
    }
}
