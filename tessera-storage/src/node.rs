//! Storage node handles
//!
//! A [`StorageNode`] is the capability the distributor uses to reach one
//! physical storage location. Every failure surfaces as a [`NodeError`],
//! which the distributor treats as "node absent" rather than fatal.

use crate::store::FragmentStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::TesseraError;
use thiserror::Error;
use tracing::{debug, info};

/// Node-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("node {node} is offline")]
    Offline { node: String },

    #[error("node {node} timed out")]
    Timeout { node: String },

    #[error("fragment {fragment} not found on node {node}")]
    NotFound { node: String, fragment: String },

    #[error("node {node} failed: {reason}")]
    Failed { node: String, reason: String },
}

impl NodeError {
    pub fn node(&self) -> &str {
        match self {
            NodeError::Offline { node }
            | NodeError::Timeout { node }
            | NodeError::NotFound { node, .. }
            | NodeError::Failed { node, .. } => node,
        }
    }
}

impl From<NodeError> for TesseraError {
    fn from(err: NodeError) -> Self {
        TesseraError::NodeUnavailable {
            node: err.node().to_string(),
        }
    }
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// Capability representing one storage location
#[async_trait]
pub trait StorageNode: Send + Sync {
    /// Stable node identifier
    fn id(&self) -> &str;

    /// Establish connectivity
    async fn connect(&self) -> NodeResult<()>;

    /// Store a fragment
    async fn put(&self, fragment_id: &str, data: Bytes) -> NodeResult<()>;

    /// Fetch a fragment
    async fn get(&self, fragment_id: &str) -> NodeResult<Bytes>;

    /// Delete a fragment, returning whether it existed
    async fn delete(&self, fragment_id: &str) -> NodeResult<bool>;

    /// Number of fragments held by the node
    async fn fragment_count(&self) -> NodeResult<usize>;

    /// Whether the node is connected and serving
    fn is_online(&self) -> bool;
}

/// A node backed by a fragment store in this process
///
/// `stop`/`start` simulate crashes; an optional artificial latency simulates
/// slow links.
pub struct LocalNode {
    id: String,
    store: Arc<dyn FragmentStore>,
    connected: AtomicBool,
    running: AtomicBool,
    latency: Option<Duration>,
}

impl LocalNode {
    pub fn new(id: impl Into<String>, store: Arc<dyn FragmentStore>) -> Self {
        Self {
            id: id.into(),
            store,
            connected: AtomicBool::new(false),
            running: AtomicBool::new(true),
            latency: None,
        }
    }

    /// Delay every operation by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn FragmentStore> {
        &self.store
    }

    /// Simulate a crash: every operation fails until `start`
    pub fn stop(&self) {
        info!(node = %self.id, "Stopping storage node");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn start(&self) {
        info!(node = %self.id, "Starting storage node");
        self.running.store(true, Ordering::SeqCst);
    }

    async fn ready(&self) -> NodeResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(NodeError::Offline {
                node: self.id.clone(),
            });
        }
        Ok(())
    }

    fn failed(&self, err: TesseraError) -> NodeError {
        NodeError::Failed {
            node: self.id.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl StorageNode for LocalNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> NodeResult<()> {
        self.ready().await?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(node = %self.id, "Storage node connected");
        Ok(())
    }

    async fn put(&self, fragment_id: &str, data: Bytes) -> NodeResult<()> {
        self.ready().await?;
        self.store.put(fragment_id, data).map_err(|e| self.failed(e))
    }

    async fn get(&self, fragment_id: &str) -> NodeResult<Bytes> {
        self.ready().await?;
        self.store
            .get(fragment_id)
            .map_err(|e| self.failed(e))?
            .ok_or_else(|| NodeError::NotFound {
                node: self.id.clone(),
                fragment: fragment_id.to_string(),
            })
    }

    async fn delete(&self, fragment_id: &str) -> NodeResult<bool> {
        self.ready().await?;
        self.store.delete(fragment_id).map_err(|e| self.failed(e))
    }

    async fn fragment_count(&self) -> NodeResult<usize> {
        self.ready().await?;
        self.store.fragment_count().map_err(|e| self.failed(e))
    }

    fn is_online(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.running.load(Ordering::SeqCst)
    }
}
