//! Storage application
//!
//! The state machine replicated by the agreement engine. Every replica
//! fronts exactly one storage node; a committed [`StorageCommand`] is
//! executed by every replica in the same order, but only the replica serving
//! the addressed node touches its fragment store. The others answer
//! [`StorageReply::NotResponsible`], which still counts as evidence that the
//! command committed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessera_core::error::Result;
use tessera_storage::FragmentStore;
use tracing::{debug, error, warn};

/// Operation on one storage node, carried as a client command payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageCommand {
    Put {
        node: String,
        fragment: String,
        data: Bytes,
    },
    Get {
        node: String,
        fragment: String,
    },
    Delete {
        node: String,
        fragment: String,
    },
    FragmentCount {
        node: String,
    },
}

impl StorageCommand {
    /// Storage node the command is addressed to
    pub fn node(&self) -> &str {
        match self {
            StorageCommand::Put { node, .. }
            | StorageCommand::Get { node, .. }
            | StorageCommand::Delete { node, .. }
            | StorageCommand::FragmentCount { node } => node,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Result of executing a [`StorageCommand`] on one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageReply {
    Stored,
    Fragment(Option<Bytes>),
    Deleted(bool),
    Count(usize),
    /// This replica does not serve the addressed node
    NotResponsible,
    Failed(String),
}

impl StorageReply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Executes committed storage commands against a replica's fragment store
pub struct StorageApplication {
    node_id: String,
    store: Arc<dyn FragmentStore>,
}

impl StorageApplication {
    pub fn new(node_id: impl Into<String>, store: Arc<dyn FragmentStore>) -> Self {
        Self {
            node_id: node_id.into(),
            store,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn FragmentStore> {
        &self.store
    }

    /// Execute an encoded command, returning the encoded reply
    pub fn execute(&self, operation: &[u8]) -> Vec<u8> {
        let reply = match StorageCommand::decode(operation) {
            Ok(command) => self.apply(command),
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "Rejecting undecodable storage command");
                StorageReply::Failed(format!("malformed command: {e}"))
            }
        };

        match reply.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(node = %self.node_id, error = %e, "Failed to encode storage reply");
                Vec::new()
            }
        }
    }

    fn apply(&self, command: StorageCommand) -> StorageReply {
        if command.node() != self.node_id {
            return StorageReply::NotResponsible;
        }

        let result = match command {
            StorageCommand::Put { fragment, data, .. } => {
                debug!(node = %self.node_id, fragment = %fragment, size = data.len(), "Storing fragment");
                self.store.put(&fragment, data).map(|_| StorageReply::Stored)
            }
            StorageCommand::Get { fragment, .. } => {
                self.store.get(&fragment).map(StorageReply::Fragment)
            }
            StorageCommand::Delete { fragment, .. } => {
                self.store.delete(&fragment).map(StorageReply::Deleted)
            }
            StorageCommand::FragmentCount { .. } => {
                self.store.fragment_count().map(StorageReply::Count)
            }
        };

        result.unwrap_or_else(|e| {
            warn!(node = %self.node_id, error = %e, "Storage command failed");
            StorageReply::Failed(e.to_string())
        })
    }
}
