//! The configured set of storage nodes

use crate::memory::MemoryStore;
use crate::node::{LocalNode, StorageNode};
use crate::sled_store::SledStore;
use crate::store::FragmentStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::config::{BackendKind, NodeSettings};
use tessera_core::error::{Result, TesseraError};
use tracing::warn;

/// Immutable collection of storage node handles, in configuration order
#[derive(Clone)]
pub struct StorageServers {
    nodes: Vec<Arc<dyn StorageNode>>,
}

impl StorageServers {
    /// Build from handles, rejecting duplicate ids
    pub fn new(nodes: Vec<Arc<dyn StorageNode>>) -> Result<Self> {
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|other| other.id() == node.id()) {
                return Err(TesseraError::Configuration(format!(
                    "duplicate storage node id {}",
                    node.id()
                )));
            }
        }
        Ok(Self { nodes })
    }

    /// Open the fragment store described by `settings`
    pub fn open_store(settings: &NodeSettings) -> Result<Arc<dyn FragmentStore>> {
        Ok(match settings.backend {
            BackendKind::Memory => Arc::new(MemoryStore::new()),
            BackendKind::Sled => {
                let dir = settings.data_dir.as_ref().ok_or_else(|| {
                    TesseraError::Configuration(format!("sled node {} needs a data_dir", settings.id))
                })?;
                Arc::new(SledStore::open(dir)?)
            }
        })
    }

    /// Local nodes for every configured storage node
    pub fn from_settings(settings: &[NodeSettings]) -> Result<Self> {
        let nodes = settings
            .iter()
            .map(|s| {
                let store = Self::open_store(s)?;
                Ok(Arc::new(LocalNode::new(s.id.clone(), store)) as Arc<dyn StorageNode>)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(nodes)
    }

    pub fn all(&self) -> &[Arc<dyn StorageNode>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<Arc<dyn StorageNode>> {
        self.nodes.iter().find(|n| n.id() == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id() == id)
    }

    pub fn online_nodes(&self) -> Vec<Arc<dyn StorageNode>> {
        self.nodes.iter().filter(|n| n.is_online()).cloned().collect()
    }

    pub fn online_node_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.is_online())
            .map(|n| n.id().to_string())
            .collect()
    }

    /// Fragment count per online node (debugging and test helper)
    pub async fn fragment_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for node in self.online_nodes() {
            match node.fragment_count().await {
                Ok(count) => {
                    counts.insert(node.id().to_string(), count);
                }
                Err(e) => warn!(node = %node.id(), error = %e, "Could not read fragment count"),
            }
        }
        counts
    }
}

impl std::fmt::Debug for StorageServers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(|n| n.id()))
            .finish()
    }
}
