//! Metadata service integration tests
//!
//! Run with: cargo test -p tessera-metadata --test metadata_test

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{CodecKind, DistributionSet, SecretSharing, TesseraError, INDEX_FRAGMENT_ID};
use tessera_metadata::{MetadataService, SyncMode};
use tessera_storage::{
    Distributor, DistributorConfig, FragmentStore, LocalNode, MemoryStore, StorageNode,
    StorageServers,
};

const THRESHOLD: usize = 3;

/// Storage shared by every service instance built on it
struct Backing {
    locals: Vec<Arc<LocalNode>>,
    distributor: Arc<Distributor>,
}

impl Backing {
    fn new(count: usize) -> Self {
        Self::with_nodes(
            (0..count)
                .map(|i| LocalNode::new(format!("node-{i}"), Arc::new(MemoryStore::new())))
                .collect(),
        )
    }

    fn with_nodes(nodes: Vec<LocalNode>) -> Self {
        let locals: Vec<Arc<LocalNode>> = nodes.into_iter().map(Arc::new).collect();
        let handles = locals
            .iter()
            .map(|n| n.clone() as Arc<dyn StorageNode>)
            .collect();
        let servers = Arc::new(StorageServers::new(handles).unwrap());
        let distributor = Arc::new(Distributor::new(
            servers,
            DistributorConfig {
                threshold: THRESHOLD,
                connect_timeout: Duration::from_millis(200),
                node_timeout: Duration::from_millis(200),
                quorum_timeout: Duration::from_millis(500),
            },
        ));
        Self { locals, distributor }
    }

    fn service(&self) -> MetadataService {
        MetadataService::new(self.distributor.clone(), codec())
    }
}

fn codec() -> SecretSharing {
    SecretSharing::new(CodecKind::Threshold, THRESHOLD).unwrap()
}

#[tokio::test]
async fn test_connect_on_empty_storage_writes_index() {
    let backing = Backing::new(4);
    let service = backing.service();

    assert_eq!(service.connect().await.unwrap(), 4);
    assert!(service.is_connected().await);
    assert!(service.list(None).await.unwrap().is_empty());

    for local in &backing.locals {
        assert!(local.store().contains(INDEX_FRAGMENT_ID).unwrap());
    }
}

#[tokio::test]
async fn test_allocation_is_idempotent() {
    let backing = Backing::new(4);
    let service = backing.service();
    service.connect().await.unwrap();

    let first = service.get_distribution_for("/a/b").await.unwrap();
    let second = service.get_distribution_for("/a/b").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);

    let other = service.get_distribution_for("/a/c").await.unwrap();
    assert_ne!(first.fragments()[0].id(), other.fragments()[0].id());
}

#[tokio::test]
async fn test_concurrent_first_touch_sees_one_set() {
    let backing = Backing::new(4);
    let service = Arc::new(backing.service());
    service.connect().await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.get_distribution_for("/shared").await.unwrap() })
        })
        .collect();

    let mut sets = Vec::new();
    for handle in handles {
        sets.push(handle.await.unwrap());
    }
    assert!(sets.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(service.list(None).await.unwrap(), vec!["/shared"]);
}

#[tokio::test]
async fn test_directory_survives_reconnect() {
    let backing = Backing::new(4);
    let service = backing.service();
    service.connect().await.unwrap();

    let b = service.get_distribution_for("/a/b").await.unwrap();
    let c = service.get_distribution_for("/a/c").await.unwrap();
    service.disconnect().await.unwrap();

    let reopened = backing.service();
    reopened.connect().await.unwrap();
    assert_eq!(reopened.list(None).await.unwrap(), vec!["/a/b", "/a/c"]);
    assert_eq!(reopened.get_distribution_for("/a/b").await.unwrap(), b);
    assert_eq!(reopened.get_distribution_for("/a/c").await.unwrap(), c);
}

#[tokio::test]
async fn test_index_readable_with_one_node_down() {
    let backing = Backing::new(4);
    let service = backing.service();
    service.connect().await.unwrap();
    let set = service.get_distribution_for("/x").await.unwrap();
    service.disconnect().await.unwrap();

    backing.locals[2].stop();
    let reopened = backing.service();
    assert_eq!(reopened.connect().await.unwrap(), 3);
    assert_eq!(reopened.get_distribution_for("/x").await.unwrap(), set);
}

#[tokio::test]
async fn test_stale_index_fragment_does_not_reset_directory() {
    let mut nodes: Vec<LocalNode> = (0..4)
        .map(|i| LocalNode::new(format!("node-{i}"), Arc::new(MemoryStore::new())))
        .collect();
    nodes[0] = LocalNode::new("node-0", Arc::new(MemoryStore::new())).with_latency(Duration::from_millis(50));
    let backing = Backing::with_nodes(nodes);
    let service = backing.service();
    service.connect().await.unwrap();
    service.get_distribution_for("/x").await.unwrap();

    // node-3 keeps the previous index while /y is added
    backing.locals[3].stop();
    service.get_distribution_for("/y").await.unwrap();
    backing.locals[3].start();

    let reopened = backing.service();
    assert_eq!(reopened.connect().await.unwrap(), 4);
    assert_eq!(reopened.list(None).await.unwrap(), vec!["/x", "/y"]);
}

#[tokio::test]
async fn test_lookup_never_allocates() {
    let backing = Backing::new(4);
    let service = backing.service().with_sync_mode(SyncMode::Deferred);
    service.connect().await.unwrap();

    assert!(service.lookup("/absent").await.unwrap().is_none());
    assert!(service.list(None).await.unwrap().is_empty());
    assert!(!service.is_dirty().await.unwrap());

    let set = service.get_distribution_for("/present").await.unwrap();
    assert_eq!(service.lookup("/present").await.unwrap(), Some(set));
}

#[tokio::test]
async fn test_delete_missing_path_still_synchronizes() {
    let backing = Backing::new(4);
    let service = backing.service().with_sync_mode(SyncMode::Deferred);
    service.connect().await.unwrap();

    service.get_distribution_for("/kept").await.unwrap();
    assert!(service.is_dirty().await.unwrap());

    service.delete("/never-existed").await.unwrap();
    assert!(!service.is_dirty().await.unwrap());

    let reopened = backing.service();
    reopened.connect().await.unwrap();
    assert_eq!(reopened.list(None).await.unwrap(), vec!["/kept"]);
}

#[tokio::test]
async fn test_delete_removes_entry() {
    let backing = Backing::new(4);
    let service = backing.service();
    service.connect().await.unwrap();

    service.get_distribution_for("/gone").await.unwrap();
    service.delete("/gone").await.unwrap();
    assert!(service.stat("/gone").await.unwrap().is_none());

    let reopened = backing.service();
    reopened.connect().await.unwrap();
    assert!(reopened.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stat_and_list() {
    let backing = Backing::new(4);
    let service = backing.service();
    service.connect().await.unwrap();

    for path in ["/docs/b", "/docs/a", "/img/c"] {
        service.get_distribution_for(path).await.unwrap();
    }

    assert_eq!(service.list(Some("/docs/")).await.unwrap(), vec!["/docs/a", "/docs/b"]);
    assert_eq!(
        service.list(None).await.unwrap(),
        vec!["/docs/a", "/docs/b", "/img/c"]
    );

    let attributes = service.stat("/img/c").await.unwrap().unwrap();
    assert!(attributes.is_empty());
    assert!(service.stat("/img/d").await.unwrap().is_none());
}

#[tokio::test]
async fn test_garbage_index_falls_back_to_empty() {
    let backing = Backing::new(4);
    for local in &backing.locals {
        local
            .store()
            .put(INDEX_FRAGMENT_ID, Bytes::from_static(b"not a share"))
            .unwrap();
    }

    let service = backing.service();
    service.connect().await.unwrap();
    assert!(service.list(None).await.unwrap().is_empty());

    // The fallback directory replaced the garbage
    let reopened = backing.service();
    reopened.connect().await.unwrap();
    assert!(reopened.is_connected().await);
}

#[tokio::test]
async fn test_malformed_directory_falls_back_to_empty() {
    let backing = Backing::new(4);
    backing.distributor.connect_servers().await;

    let mut set = DistributionSet::with_fragment_id(
        INDEX_FRAGMENT_ID,
        backing.distributor.servers().online_node_ids(),
    )
    .unwrap();
    codec()
        .encode_into(&[0, 0, 0, 9, 1, 2], &mut set)
        .unwrap();
    backing.distributor.put_fragment_set(&set).await.unwrap();

    let service = backing.service();
    service.connect().await.unwrap();
    assert!(service.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_calls_before_connect_fail() {
    let backing = Backing::new(4);
    let service = backing.service();

    assert!(matches!(
        service.get_distribution_for("/a").await,
        Err(TesseraError::NotConnected)
    ));
    assert!(matches!(service.synchronize().await, Err(TesseraError::NotConnected)));
    assert!(matches!(service.list(None).await, Err(TesseraError::NotConnected)));
    assert!(matches!(service.stat("/a").await, Err(TesseraError::NotConnected)));
    assert!(matches!(service.lookup("/a").await, Err(TesseraError::NotConnected)));
    assert!(matches!(service.delete("/a").await, Err(TesseraError::NotConnected)));
    assert!(matches!(service.disconnect().await, Err(TesseraError::NotConnected)));

    service.connect().await.unwrap();
    service.disconnect().await.unwrap();
    assert!(matches!(service.list(None).await, Err(TesseraError::NotConnected)));
}

#[tokio::test]
async fn test_deferred_mode_persists_on_synchronize() {
    let backing = Backing::new(4);
    let service = backing.service().with_sync_mode(SyncMode::Deferred);
    service.connect().await.unwrap();

    let set = service.get_distribution_for("/lazy").await.unwrap();
    assert!(service.is_dirty().await.unwrap());

    let before = backing.service();
    before.connect().await.unwrap();
    assert!(before.list(None).await.unwrap().is_empty());

    service.synchronize().await.unwrap();
    assert!(!service.is_dirty().await.unwrap());

    let after = backing.service();
    after.connect().await.unwrap();
    assert_eq!(after.get_distribution_for("/lazy").await.unwrap(), set);
}

#[tokio::test]
async fn test_failed_eager_write_rolls_back() {
    let backing = Backing::new(4);
    let service = backing.service();
    service.connect().await.unwrap();

    // Two online nodes cannot hold a threshold-3 index
    backing.locals[0].stop();
    backing.locals[1].stop();
    assert_eq!(backing.distributor.servers().online_node_ids().len(), 2);

    assert!(service.get_distribution_for("/doomed").await.is_err());
    assert!(service.stat("/doomed").await.unwrap().is_none());
}
