//! Replicated storage node handle
//!
//! A [`ReplicatedNode`] is a [`StorageNode`] whose operations are ordered by
//! the agreement cluster before they touch storage. Each operation becomes
//! one client command sent to every replica. It completes once `f+1`
//! distinct replicas reported the command executed (so at least one honest
//! replica committed it) and the replica serving this node returned its
//! result.

use crate::application::{StorageCommand, StorageReply};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_bft::{ClientCommand, ReplicaId, TransactionResult};
use tessera_storage::{NodeError, NodeResult, StorageNode};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

/// How a replicated node reaches the agreement cluster
#[derive(Debug, Clone)]
pub struct ClusterRoute {
    /// Every replica of the cluster
    pub replicas: Vec<ReplicaId>,
    /// Replica whose storage holds this node's fragments
    pub responsible: ReplicaId,
    /// Tolerated faulty replicas
    pub faulty: usize,
    /// Upper bound on one agreement round trip
    pub request_timeout: Duration,
}

/// Storage node reached through Byzantine agreement
pub struct ReplicatedNode {
    id: String,
    client_id: String,
    route: ClusterRoute,
    transport: Arc<dyn Transport>,
    /// Also serialises requests: a client has at most one outstanding
    results: Mutex<UnboundedReceiver<TransactionResult>>,
    next_request: AtomicU64,
    online: AtomicBool,
}

impl ReplicatedNode {
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        route: ClusterRoute,
        transport: Arc<dyn Transport>,
        results: UnboundedReceiver<TransactionResult>,
    ) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
            route,
            transport,
            results: Mutex::new(results),
            next_request: AtomicU64::new(0),
            online: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn route(&self) -> &ClusterRoute {
        &self.route
    }

    /// Order `command` through the cluster and return the serving replica's reply
    pub async fn submit(&self, command: StorageCommand) -> NodeResult<StorageReply> {
        let operation = command.encode().map_err(|e| self.failed(e.to_string()))?;
        let mut results = self.results.lock().await;
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        let command = ClientCommand::new(self.client_id.clone(), request_id, operation);

        for replica in &self.route.replicas {
            self.transport.submit(*replica, command.clone());
        }

        let deadline = Instant::now() + self.route.request_timeout;
        let mut answered = BTreeSet::new();
        let mut own = None;
        while own.is_none() || answered.len() <= self.route.faulty {
            match timeout_at(deadline, results.recv()).await {
                Ok(Some(result)) => {
                    if result.request_id != request_id
                        || !self.route.replicas.contains(&result.replica)
                    {
                        trace!(node = %self.id, request = result.request_id, "Ignoring unrelated result");
                        continue;
                    }
                    if answered.insert(result.replica) && result.replica == self.route.responsible {
                        own = Some(result.result);
                    }
                }
                Ok(None) => return Err(self.failed("result channel closed".to_string())),
                Err(_) => {
                    warn!(
                        node = %self.id,
                        request = request_id,
                        answered = answered.len(),
                        "Agreement did not complete in time"
                    );
                    self.online.store(false, Ordering::SeqCst);
                    return Err(NodeError::Timeout {
                        node: self.id.clone(),
                    });
                }
            }
        }

        debug!(node = %self.id, request = request_id, answered = answered.len(), "Command committed");
        self.online.store(true, Ordering::SeqCst);
        let own = own.unwrap_or_default();
        StorageReply::decode(&own).map_err(|e| self.failed(format!("undecodable reply: {e}")))
    }

    fn failed(&self, reason: String) -> NodeError {
        NodeError::Failed {
            node: self.id.clone(),
            reason,
        }
    }

    fn unexpected(&self, reply: StorageReply) -> NodeError {
        match reply {
            StorageReply::Failed(reason) => self.failed(reason),
            StorageReply::NotResponsible => self.failed(format!(
                "replica {} does not serve this node",
                self.route.responsible
            )),
            other => self.failed(format!("unexpected reply {other:?}")),
        }
    }
}

#[async_trait]
impl StorageNode for ReplicatedNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> NodeResult<()> {
        self.fragment_count().await.map(|_| ())
    }

    async fn put(&self, fragment_id: &str, data: Bytes) -> NodeResult<()> {
        let command = StorageCommand::Put {
            node: self.id.clone(),
            fragment: fragment_id.to_string(),
            data,
        };
        match self.submit(command).await? {
            StorageReply::Stored => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn get(&self, fragment_id: &str) -> NodeResult<Bytes> {
        let command = StorageCommand::Get {
            node: self.id.clone(),
            fragment: fragment_id.to_string(),
        };
        match self.submit(command).await? {
            StorageReply::Fragment(Some(data)) => Ok(data),
            StorageReply::Fragment(None) => Err(NodeError::NotFound {
                node: self.id.clone(),
                fragment: fragment_id.to_string(),
            }),
            other => Err(self.unexpected(other)),
        }
    }

    async fn delete(&self, fragment_id: &str) -> NodeResult<bool> {
        let command = StorageCommand::Delete {
            node: self.id.clone(),
            fragment: fragment_id.to_string(),
        };
        match self.submit(command).await? {
            StorageReply::Deleted(existed) => Ok(existed),
            other => Err(self.unexpected(other)),
        }
    }

    async fn fragment_count(&self) -> NodeResult<usize> {
        let command = StorageCommand::FragmentCount {
            node: self.id.clone(),
        };
        match self.submit(command).await? {
            StorageReply::Count(count) => Ok(count),
            other => Err(self.unexpected(other)),
        }
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
