//! In-process agreement cluster
//!
//! Starts one replica task per configured replica on a shared
//! [`LocalNetwork`], each fronting the fragment store of the storage node it
//! serves, and hands out [`ReplicatedNode`] handles for those nodes.

use crate::application::StorageApplication;
use crate::client::{ClusterRoute, ReplicatedNode};
use crate::replica::{Replica, ReplicaHandle, ReplicaStats};
use crate::transport::{LocalNetwork, ReplicaInput, Transport};
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;
use tessera_bft::{
    parse_verifying_key, EngineConfig, ReplicaId, ReplicaInfo, ReplicaSet, SequenceNumber,
    SigningKey, ViewNumber,
};
use tessera_core::config::ClusterConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_storage::{StorageNode, StorageServers};
use tracing::info;
use uuid::Uuid;

/// Running replicas plus the network connecting them
pub struct ReplicaCluster {
    network: Arc<LocalNetwork>,
    replicas: Vec<ReplicaHandle>,
    faulty: usize,
    request_timeout: Duration,
}

impl ReplicaCluster {
    /// Start every configured replica with freshly generated keys
    pub fn start(config: &ClusterConfig) -> Result<Self> {
        let keys = config
            .replicas
            .iter()
            .map(|_| SigningKey::generate(&mut OsRng))
            .collect();
        Self::start_with_keys(config, keys)
    }

    /// Start every configured replica with the given signing keys, in
    /// replica order
    ///
    /// Configured public keys must match the corresponding signing key.
    pub fn start_with_keys(config: &ClusterConfig, keys: Vec<SigningKey>) -> Result<Self> {
        config.validate()?;
        if keys.len() != config.replicas.len() {
            return Err(TesseraError::Configuration(format!(
                "{} signing keys for {} replicas",
                keys.len(),
                config.replicas.len()
            )));
        }

        let mut members = Vec::with_capacity(keys.len());
        for (settings, key) in config.replicas.iter().zip(&keys) {
            let verifying_key = key.verifying_key();
            if let Some(configured) = &settings.public_key {
                if parse_verifying_key(configured)? != verifying_key {
                    return Err(TesseraError::Configuration(format!(
                        "signing key of replica {} does not match its configured public key",
                        settings.id
                    )));
                }
            }
            members.push(ReplicaInfo::new(settings.id, settings.address.clone(), verifying_key));
        }
        let replica_set = ReplicaSet::new(members, config.agreement.faulty)?;

        let network = Arc::new(LocalNetwork::new());
        let transport: Arc<dyn Transport> = network.clone();
        let mut replicas = Vec::with_capacity(keys.len());
        for (settings, key) in config.replicas.iter().zip(keys) {
            let node = config
                .storage
                .nodes
                .iter()
                .find(|n| n.id == settings.storage_node)
                .ok_or_else(|| {
                    TesseraError::Configuration(format!(
                        "replica {} serves unknown storage node {}",
                        settings.id, settings.storage_node
                    ))
                })?;
            let public_key = hex::encode(key.verifying_key().to_bytes());
            let store = StorageServers::open_store(node)?;
            let inbox = network.register_replica(settings.id);
            let replica = Replica::new(
                EngineConfig::from_cluster(settings.id, config),
                replica_set.clone(),
                key,
                transport.clone(),
                StorageApplication::new(node.id.clone(), store),
                inbox,
            )?;
            info!(
                replica = settings.id,
                node = %node.id,
                public_key = %public_key,
                "Starting replica"
            );
            replicas.push(replica.spawn());
        }

        Ok(Self {
            network,
            replicas,
            faulty: config.agreement.faulty,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn replicas(&self) -> &[ReplicaHandle] {
        &self.replicas
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&ReplicaHandle> {
        self.replicas.iter().find(|r| r.id() == id)
    }

    pub fn stats(&self) -> Vec<ReplicaStats> {
        self.replicas.iter().map(ReplicaHandle::stats).collect()
    }

    /// Replica serving `node_id`
    pub fn serving(&self, node_id: &str) -> Option<&ReplicaHandle> {
        self.replicas.iter().find(|r| r.node_id() == node_id)
    }

    /// Cut a replica off the network, as if it crashed
    pub fn crash(&self, id: ReplicaId) {
        info!(replica = id, "Crashing replica");
        self.network.isolate(id);
    }

    pub fn recover(&self, id: ReplicaId) {
        info!(replica = id, "Recovering replica");
        self.network.heal(id);
    }

    /// Tell every replica that the external view change moved to `view`
    pub fn install_view(&self, view: ViewNumber, next_sequence: SequenceNumber) {
        for replica in &self.replicas {
            self.network.push_input(
                replica.id(),
                ReplicaInput::InstallView {
                    view,
                    next_sequence,
                },
            );
        }
    }

    /// A handle to storage node `node_id` routed through the cluster
    pub fn replicated_node(&self, node_id: &str) -> Result<ReplicatedNode> {
        let responsible = self
            .serving(node_id)
            .ok_or_else(|| TesseraError::NotFound(format!("no replica serves {node_id}")))?
            .id();
        let client_id = format!("{node_id}/{}", Uuid::new_v4());
        let results = self.network.register_client(&client_id);
        let route = ClusterRoute {
            replicas: self.replicas.iter().map(ReplicaHandle::id).collect(),
            responsible,
            faulty: self.faulty,
            request_timeout: self.request_timeout,
        };
        Ok(ReplicatedNode::new(
            node_id,
            client_id,
            route,
            self.network.clone(),
            results,
        ))
    }

    /// Replicated handles for every served storage node
    pub fn storage_servers(&self) -> Result<StorageServers> {
        let mut nodes: Vec<Arc<dyn StorageNode>> = Vec::with_capacity(self.replicas.len());
        for replica in &self.replicas {
            nodes.push(Arc::new(self.replicated_node(replica.node_id())?));
        }
        StorageServers::new(nodes)
    }

    /// Stop every replica task
    pub async fn shutdown(mut self) {
        for replica in &mut self.replicas {
            replica.shutdown().await;
            self.network.unregister_replica(replica.id());
        }
        info!("Replica cluster stopped");
    }
}
