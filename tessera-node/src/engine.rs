//! Object storage facade
//!
//! Ties the metadata service, the codec and the distributor together into
//! whole-object operations: a path resolves to its distribution set, the
//! payload is secret-shared across it, and reads reconstruct from any
//! threshold of fragments.

use bytes::Bytes;
use std::sync::Arc;
use tessera_core::codec::SecretSharing;
use tessera_core::config::ClusterConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_metadata::{Attributes, MetadataService, SyncMode};
use tessera_storage::{Distributor, DistributorConfig, PutReport, StorageServers};
use tracing::{debug, info};

pub struct StorageEngine {
    metadata: MetadataService,
    distributor: Arc<Distributor>,
}

impl StorageEngine {
    pub fn new(distributor: Arc<Distributor>, codec: SecretSharing) -> Self {
        Self {
            metadata: MetadataService::new(distributor.clone(), codec),
            distributor,
        }
    }

    /// Engine over `servers` with codec and timeouts taken from `config`
    pub fn from_config(config: &ClusterConfig, servers: StorageServers) -> Result<Self> {
        let distributor = Arc::new(Distributor::new(
            Arc::new(servers),
            DistributorConfig::from_cluster(config),
        ));
        Ok(Self::new(distributor, config.codec()?))
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.metadata = self.metadata.with_sync_mode(sync_mode);
        self
    }

    pub fn metadata(&self) -> &MetadataService {
        &self.metadata
    }

    pub fn distributor(&self) -> &Arc<Distributor> {
        &self.distributor
    }

    pub async fn connect(&self) -> Result<usize> {
        let reachable = self.metadata.connect().await?;
        info!(reachable, "Storage engine connected");
        Ok(reachable)
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.metadata.disconnect().await
    }

    /// Store `data` under `path`, replacing any previous content
    pub async fn put_object(&self, path: &str, data: &[u8]) -> Result<PutReport> {
        let mut set = self.metadata.get_distribution_for(path).await?;
        self.metadata.codec().encode_into(data, &mut set)?;
        let report = self.distributor.put_fragment_set(&set).await?;
        debug!(path, size = data.len(), written = report.success_count(), "Object stored");
        Ok(report)
    }

    /// Reconstruct the object stored under `path`
    pub async fn get_object(&self, path: &str) -> Result<Bytes> {
        let mut set = self
            .metadata
            .lookup(path)
            .await?
            .ok_or_else(|| TesseraError::NotFound(path.to_string()))?;
        let data = self
            .distributor
            .get_fragment_set(&mut set, self.metadata.codec())
            .await?;
        debug!(path, size = data.len(), "Object reconstructed");
        Ok(data)
    }

    /// Remove the fragments of `path` and forget it; false if it was unknown
    pub async fn delete_object(&self, path: &str) -> Result<bool> {
        let Some(set) = self.metadata.lookup(path).await? else {
            return Ok(false);
        };
        let deleted = self.distributor.delete_fragment_set(&set).await;
        self.metadata.delete(path).await?;
        debug!(path, deleted, "Object deleted");
        Ok(true)
    }

    pub async fn stat_object(&self, path: &str) -> Result<Option<Attributes>> {
        self.metadata.stat(path).await
    }

    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        self.metadata.list(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::CodecKind;

    fn engine() -> StorageEngine {
        let config = ClusterConfig::local(4, 1, 3);
        let servers = StorageServers::from_settings(&config.storage.nodes).unwrap();
        StorageEngine::from_config(&config, servers).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let engine = engine();
        assert_eq!(engine.connect().await.unwrap(), 4);

        engine.put_object("/a/b", b"hello tessera").await.unwrap();
        assert_eq!(engine.get_object("/a/b").await.unwrap().as_ref(), b"hello tessera");

        engine.put_object("/a/b", b"replaced").await.unwrap();
        assert_eq!(engine.get_object("/a/b").await.unwrap().as_ref(), b"replaced");
    }

    #[tokio::test]
    async fn test_missing_object() {
        let engine = engine();
        engine.connect().await.unwrap();
        assert!(matches!(
            engine.get_object("/missing").await,
            Err(TesseraError::NotFound(_))
        ));
        assert!(!engine.delete_object("/missing").await.unwrap());
        assert!(engine.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_racing_delete_does_not_recreate_path() {
        let engine = Arc::new(engine());
        engine.connect().await.unwrap();
        engine.put_object("/racy", b"short lived").await.unwrap();

        let reader = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    let _ = engine.get_object("/racy").await;
                }
            })
        };
        assert!(engine.delete_object("/racy").await.unwrap());
        reader.await.unwrap();

        assert!(engine.stat_object("/racy").await.unwrap().is_none());
        assert!(engine.list(None).await.unwrap().is_empty());
        assert!(matches!(
            engine.get_object("/racy").await,
            Err(TesseraError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_object() {
        let engine = engine();
        engine.connect().await.unwrap();
        engine.put_object("/x", b"payload").await.unwrap();
        assert!(engine.delete_object("/x").await.unwrap());
        assert!(engine.stat_object("/x").await.unwrap().is_none());

        // Only the index fragments remain
        let counts = engine.distributor().servers().fragment_counts().await;
        assert!(counts.values().all(|count| *count == 1));
    }

    #[tokio::test]
    async fn test_mirror_codec() {
        let config = ClusterConfig::local(4, 1, 2);
        let servers = StorageServers::from_settings(&config.storage.nodes).unwrap();
        let distributor = Arc::new(Distributor::new(
            Arc::new(servers),
            DistributorConfig::from_cluster(&config),
        ));
        let engine = StorageEngine::new(
            distributor,
            SecretSharing::new(CodecKind::Mirror, 2).unwrap(),
        );
        engine.connect().await.unwrap();
        engine.put_object("/m", b"mirrored").await.unwrap();
        assert_eq!(engine.get_object("/m").await.unwrap().as_ref(), b"mirrored");
    }
}
