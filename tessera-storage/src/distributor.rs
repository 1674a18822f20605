//! Fragment distributor
//!
//! Bridges distribution sets to storage nodes: writes and reads every
//! fragment concurrently, bounds each node call by a per-node timeout and
//! the whole operation by a quorum timeout, and reduces individual node
//! failures to a single threshold decision.

use crate::node::{NodeError, NodeResult, StorageNode};
use crate::servers::StorageServers;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::codec::SecretSharing;
use tessera_core::config::ClusterConfig;
use tessera_core::error::{ReconstructionError, Result, TesseraError};
use tessera_core::fragment::DistributionSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Distributor configuration
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Fragments needed to reconstruct (K)
    pub threshold: usize,
    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,
    /// Timeout for a single fragment operation
    pub node_timeout: Duration,
    /// Timeout for a whole fan-out operation
    pub quorum_timeout: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            connect_timeout: Duration::from_secs(2),
            node_timeout: Duration::from_secs(2),
            quorum_timeout: Duration::from_secs(5),
        }
    }
}

impl DistributorConfig {
    pub fn from_cluster(config: &ClusterConfig) -> Self {
        Self {
            threshold: config.storage.threshold,
            connect_timeout: config.timeouts.connect(),
            node_timeout: config.timeouts.node(),
            quorum_timeout: config.timeouts.quorum(),
        }
    }
}

/// Result of a single node operation
#[derive(Debug)]
pub struct NodeOutcome {
    pub node_id: String,
    pub error: Option<NodeError>,
    pub latency_ms: u64,
}

/// Aggregated result of writing a distribution set
#[derive(Debug)]
pub struct PutReport {
    /// Nodes that stored their fragment
    pub written: Vec<String>,
    /// Nodes that did not
    pub failures: Vec<NodeOutcome>,
    pub total_latency_ms: u64,
}

impl PutReport {
    pub fn success_count(&self) -> usize {
        self.written.len()
    }
}

/// Fans fragment I/O out across storage nodes
pub struct Distributor {
    servers: Arc<StorageServers>,
    config: DistributorConfig,
}

impl Distributor {
    pub fn new(servers: Arc<StorageServers>, config: DistributorConfig) -> Self {
        Self { servers, config }
    }

    pub fn servers(&self) -> &Arc<StorageServers> {
        &self.servers
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    fn resolve(&self, node_id: &str) -> NodeResult<Arc<dyn StorageNode>> {
        self.servers.node(node_id).ok_or_else(|| NodeError::Failed {
            node: node_id.to_string(),
            reason: "unknown storage node".to_string(),
        })
    }

    /// Connect every configured node, returning how many are reachable
    ///
    /// Attempts run concurrently and each is bounded by the connect timeout,
    /// so the call never outlives that timeout.
    pub async fn connect_servers(&self) -> usize {
        let connect_timeout = self.config.connect_timeout;
        let mut pending: FuturesUnordered<_> = self
            .servers
            .all()
            .iter()
            .cloned()
            .map(|node| async move {
                let result = timeout(connect_timeout, node.connect()).await;
                (node, result)
            })
            .collect();

        let mut reachable = 0;
        while let Some((node, result)) = pending.next().await {
            match result {
                Ok(Ok(())) => reachable += 1,
                Ok(Err(e)) => warn!(node = %node.id(), error = %e, "Storage node refused connection"),
                Err(_) => warn!(node = %node.id(), "Storage node connection timed out"),
            }
        }

        info!(
            reachable,
            configured = self.servers.len(),
            "Connected storage servers"
        );
        reachable
    }

    /// Write every fragment of `set` to its node
    ///
    /// Succeeds when at least `threshold` writes landed; individual failures
    /// are logged and reported.
    pub async fn put_fragment_set(&self, set: &DistributionSet) -> Result<PutReport> {
        let start = Instant::now();
        let node_timeout = self.config.node_timeout;

        let mut pending = FuturesUnordered::new();
        for fragment in set.fragments() {
            let payload = fragment.payload().cloned().ok_or_else(|| {
                TesseraError::Storage(format!(
                    "fragment {} for node {} has no payload",
                    fragment.id(),
                    fragment.node_id()
                ))
            })?;
            let node = self.resolve(fragment.node_id());
            let node_id = fragment.node_id().to_string();
            let fragment_id = fragment.id().to_string();
            pending.push(async move {
                let node_start = Instant::now();
                let result = match node {
                    Ok(node) => call_with_timeout(&node_id, node_timeout, node.put(&fragment_id, payload)).await,
                    Err(e) => Err(e),
                };
                NodeOutcome {
                    node_id,
                    error: result.err(),
                    latency_ms: node_start.elapsed().as_millis() as u64,
                }
            });
        }

        debug!(fragments = set.len(), "Starting fragment set write");

        let deadline = tokio::time::Instant::now() + self.config.quorum_timeout;
        let mut written = Vec::new();
        let mut failures = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(outcome)) => match &outcome.error {
                    None => written.push(outcome.node_id),
                    Some(e) => {
                        warn!(node = %outcome.node_id, error = %e, "Fragment write failed");
                        failures.push(outcome);
                    }
                },
                Ok(None) => break,
                Err(_) => {
                    warn!(outstanding = pending.len(), "Fragment write deadline reached");
                    break;
                }
            }
        }

        let total_latency_ms = start.elapsed().as_millis() as u64;
        if written.len() < self.config.threshold {
            warn!(
                written = written.len(),
                needed = self.config.threshold,
                "Fragment set write below reconstruction threshold"
            );
            return Err(ReconstructionError::InsufficientFragments {
                available: written.len(),
                required: self.config.threshold,
            }
            .into());
        }

        debug!(
            written = written.len(),
            failed = failures.len(),
            latency_ms = total_latency_ms,
            "Fragment set written"
        );
        Ok(PutReport {
            written,
            failures,
            total_latency_ms,
        })
    }

    /// Read fragments of `set` until they reconstruct, returning the blob
    ///
    /// Payloads are filled in as nodes answer. Once `threshold` of them
    /// arrived every further payload triggers another decode attempt, so a
    /// stale or corrupt fragment is outvoted by slower current ones. Fails
    /// with the last reconstruction error when every node answered (or
    /// timed out) without a decodable subset.
    pub async fn get_fragment_set(&self, set: &mut DistributionSet, codec: &SecretSharing) -> Result<Bytes> {
        set.clear_payloads();
        let node_timeout = self.config.node_timeout;

        let mut pending: FuturesUnordered<_> = set
            .fragments()
            .iter()
            .enumerate()
            .map(|(idx, fragment)| {
                let node = self.resolve(fragment.node_id());
                let node_id = fragment.node_id().to_string();
                let fragment_id = fragment.id().to_string();
                async move {
                    let result: NodeResult<Bytes> = match node {
                        Ok(node) => call_with_timeout(&node_id, node_timeout, node.get(&fragment_id)).await,
                        Err(e) => Err(e),
                    };
                    (idx, result)
                }
            })
            .collect();

        let deadline = tokio::time::Instant::now() + self.config.quorum_timeout;
        let mut collected = 0;
        let mut last_error = None;
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((idx, Ok(payload)))) => {
                    set.fragments_mut()[idx].set_payload(payload);
                    collected += 1;
                    if collected < self.config.threshold {
                        continue;
                    }
                    match codec.decode_set(set) {
                        Ok(blob) => {
                            debug!(collected, size = blob.len(), "Fragment set reconstructed");
                            return Ok(blob);
                        }
                        Err(e) => {
                            debug!(collected, error = %e, "Fragments read so far do not reconstruct");
                            last_error = Some(e);
                        }
                    }
                }
                Ok(Some((_, Err(e)))) => {
                    debug!(node = %e.node(), error = %e, "Fragment read failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(outstanding = pending.len(), "Fragment read deadline reached");
                    break;
                }
            }
        }

        let error = last_error.unwrap_or(ReconstructionError::InsufficientFragments {
            available: collected,
            required: self.config.threshold,
        });
        Err(error.into())
    }

    /// Best-effort removal of every fragment of `set`
    pub async fn delete_fragment_set(&self, set: &DistributionSet) -> usize {
        let node_timeout = self.config.node_timeout;
        let mut pending: FuturesUnordered<_> = set
            .fragments()
            .iter()
            .map(|fragment| {
                let node = self.resolve(fragment.node_id());
                let node_id = fragment.node_id().to_string();
                let fragment_id = fragment.id().to_string();
                async move {
                    match node {
                        Ok(node) => call_with_timeout(&node_id, node_timeout, node.delete(&fragment_id)).await,
                        Err(e) => Err(e),
                    }
                }
            })
            .collect();

        let mut deleted = 0;
        while let Some(result) = pending.next().await {
            match result {
                Ok(_) => deleted += 1,
                Err(e) => warn!(node = %e.node(), error = %e, "Fragment delete failed"),
            }
        }
        deleted
    }
}

async fn call_with_timeout<T, F>(node_id: &str, limit: Duration, call: F) -> NodeResult<T>
where
    F: std::future::Future<Output = NodeResult<T>>,
{
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(NodeError::Timeout {
            node: node_id.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::node::LocalNode;
    use tessera_core::CodecKind;

    fn servers(count: usize) -> (Arc<StorageServers>, Vec<Arc<LocalNode>>) {
        let locals: Vec<Arc<LocalNode>> = (0..count)
            .map(|i| Arc::new(LocalNode::new(format!("node-{i}"), Arc::new(MemoryStore::new()))))
            .collect();
        let handles = locals
            .iter()
            .map(|n| n.clone() as Arc<dyn StorageNode>)
            .collect();
        (Arc::new(StorageServers::new(handles).unwrap()), locals)
    }

    fn filled_set(count: usize) -> DistributionSet {
        let mut set =
            DistributionSet::with_random_ids((0..count).map(|i| format!("node-{i}"))).unwrap();
        for (i, fragment) in set.fragments_mut().iter_mut().enumerate() {
            fragment.set_payload(Bytes::from(vec![i as u8; 8]));
        }
        set
    }

    #[tokio::test]
    async fn test_put_without_payload_is_rejected() {
        let (servers, _) = servers(2);
        let distributor = Distributor::new(servers, DistributorConfig::default());
        let set = DistributionSet::with_random_ids(["node-0", "node-1"]).unwrap();
        assert!(matches!(
            distributor.put_fragment_set(&set).await,
            Err(TesseraError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_node_counts_as_absent() {
        let (servers, _) = servers(3);
        let distributor = Distributor::new(
            servers,
            DistributorConfig {
                threshold: 2,
                ..Default::default()
            },
        );
        distributor.connect_servers().await;

        let mut set = DistributionSet::with_random_ids(["node-0", "node-1", "ghost"]).unwrap();
        for fragment in set.fragments_mut() {
            fragment.set_payload(Bytes::from_static(b"x"));
        }
        let report = distributor.put_fragment_set(&set).await.unwrap();
        assert_eq!(report.success_count(), 2);
        assert_eq!(report.failures[0].node_id, "ghost");
    }

    #[tokio::test]
    async fn test_read_stops_once_decodable() {
        let (servers, _) = servers(5);
        let distributor = Distributor::new(servers, DistributorConfig::default());
        distributor.connect_servers().await;

        let codec = SecretSharing::new(CodecKind::Threshold, 3).unwrap();
        let mut set = DistributionSet::with_random_ids((0..5).map(|i| format!("node-{i}"))).unwrap();
        codec.encode_into(b"five ways", &mut set).unwrap();
        distributor.put_fragment_set(&set).await.unwrap();

        let blob = distributor.get_fragment_set(&mut set, &codec).await.unwrap();
        assert_eq!(blob.as_ref(), b"five ways");
        assert_eq!(set.payload_count(), 3);
    }

    #[tokio::test]
    async fn test_undecodable_payloads_report_reconstruction_error() {
        let (servers, _) = servers(4);
        let distributor = Distributor::new(servers, DistributorConfig::default());
        distributor.connect_servers().await;

        let mut set = filled_set(4);
        distributor.put_fragment_set(&set).await.unwrap();

        let codec = SecretSharing::new(CodecKind::Threshold, 3).unwrap();
        let err = distributor.get_fragment_set(&mut set, &codec).await.unwrap_err();
        assert!(err.is_reconstruction_failure());
        assert_eq!(set.payload_count(), 4);
    }

    #[tokio::test]
    async fn test_delete_counts_answering_nodes() {
        let (servers, locals) = servers(3);
        let distributor = Distributor::new(servers, DistributorConfig::default());
        distributor.connect_servers().await;

        let set = filled_set(3);
        distributor.put_fragment_set(&set).await.unwrap();
        locals[1].stop();

        assert_eq!(distributor.delete_fragment_set(&set).await, 2);
        assert_eq!(locals[0].store().fragment_count().unwrap(), 0);
        assert_eq!(locals[1].store().fragment_count().unwrap(), 1);
    }
}
