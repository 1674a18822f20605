//! End-to-end integration tests for Tessera
//!
//! Objects are secret-shared over 4 storage nodes with threshold 3, either
//! directly or through a 4 replica agreement cluster tolerating one fault.
//!
//! Run with: cargo test -p tessera-node --test end_to_end

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tessera_core::{BackendKind, ClusterConfig, TimeoutSettings};
use tessera_node::{ReplicaCluster, StorageEngine};
use tessera_storage::{LocalNode, MemoryStore, StorageNode, StorageServers};

/// Generate test data of the given size
fn generate_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn cluster_config() -> ClusterConfig {
    let mut config = ClusterConfig::local(4, 1, 3);
    config.agreement.request_timeout_ms = 1_000;
    config.timeouts = TimeoutSettings {
        connect_ms: 2_000,
        node_ms: 2_000,
        quorum_ms: 4_000,
    };
    config
}

/// Wait until every listed replica executed the same number of commands
async fn wait_for_convergence(cluster: &ReplicaCluster, replicas: &[u32]) -> u64 {
    for _ in 0..100 {
        let executed: Vec<u64> = replicas
            .iter()
            .map(|id| cluster.replica(*id).unwrap().stats().last_executed)
            .collect();
        if executed.windows(2).all(|w| w[0] == w[1]) {
            return executed[0];
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("replicas did not converge");
}

#[tokio::test]
async fn test_local_nodes_survive_one_failure() {
    let config = cluster_config();
    let locals: Vec<Arc<LocalNode>> = (0..4)
        .map(|i| Arc::new(LocalNode::new(format!("node-{i}"), Arc::new(MemoryStore::new()))))
        .collect();
    let servers = StorageServers::new(
        locals
            .iter()
            .map(|n| n.clone() as Arc<dyn StorageNode>)
            .collect(),
    )
    .unwrap();
    let engine = StorageEngine::from_config(&config, servers).unwrap();
    assert_eq!(engine.connect().await.unwrap(), 4);

    let payload = generate_payload(64 * 1024);
    engine.put_object("/a/b", &payload).await.unwrap();
    assert!(engine.stat_object("/a/b").await.unwrap().is_some());

    locals[3].stop();
    assert_eq!(engine.get_object("/a/b").await.unwrap().as_ref(), payload.as_slice());

    locals[2].stop();
    let err = engine.get_object("/a/b").await.unwrap_err();
    assert!(err.is_reconstruction_failure(), "unexpected error: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicated_nodes_survive_one_failure() {
    let config = cluster_config();
    let cluster = ReplicaCluster::start(&config).unwrap();
    let engine = StorageEngine::from_config(&config, cluster.storage_servers().unwrap()).unwrap();
    assert_eq!(engine.connect().await.unwrap(), 4);

    let payload = generate_payload(16 * 1024);
    engine.put_object("/a/b", &payload).await.unwrap();
    assert!(engine.stat_object("/a/b").await.unwrap().is_some());

    cluster.crash(3);
    assert_eq!(engine.get_object("/a/b").await.unwrap().as_ref(), payload.as_slice());

    cluster.crash(2);
    let err = engine.get_object("/a/b").await.unwrap_err();
    assert!(err.is_reconstruction_failure(), "unexpected error: {err}");

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fragments_land_on_serving_replica_only() {
    let config = cluster_config();
    let cluster = ReplicaCluster::start(&config).unwrap();
    let engine = StorageEngine::from_config(&config, cluster.storage_servers().unwrap()).unwrap();
    engine.connect().await.unwrap();

    engine.put_object("/placed", b"somewhere").await.unwrap();
    let set = engine.metadata().get_distribution_for("/placed").await.unwrap();

    for fragment in set.fragments() {
        for replica in cluster.replicas() {
            let holds = replica.store().contains(fragment.id()).unwrap();
            assert_eq!(holds, replica.node_id() == fragment.node_id());
        }
    }

    let executed = wait_for_convergence(&cluster, &[0, 1, 2, 3]).await;
    assert!(executed > 0);
    assert!(cluster.stats().iter().all(|s| s.suspects.is_empty()));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_replica_from_start() {
    let config = cluster_config();
    let cluster = ReplicaCluster::start(&config).unwrap();
    cluster.crash(3);

    let engine = StorageEngine::from_config(&config, cluster.storage_servers().unwrap()).unwrap();
    assert_eq!(engine.connect().await.unwrap(), 3);

    engine.put_object("/three", b"three of four").await.unwrap();
    let set = engine.metadata().get_distribution_for("/three").await.unwrap();
    assert_eq!(set.len(), 3);
    assert!(set.fragment_for_node("node-3").is_none());
    assert_eq!(engine.get_object("/three").await.unwrap().as_ref(), b"three of four");

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recovered_replica_serves_its_node_again() {
    let mut config = cluster_config();
    config.agreement.checkpoint_interval = 4;
    let cluster = ReplicaCluster::start(&config).unwrap();
    let engine = StorageEngine::from_config(&config, cluster.storage_servers().unwrap()).unwrap();
    assert_eq!(engine.connect().await.unwrap(), 4);
    engine.put_object("/before", b"all four").await.unwrap();

    cluster.crash(3);
    for i in 0..3 {
        engine
            .put_object(&format!("/while-down/{i}"), b"three of four")
            .await
            .unwrap();
    }
    cluster.recover(3);

    // Replica 3 has to catch up before it can answer for node-3
    let node = cluster.replicated_node("node-3").unwrap();
    assert!(node.fragment_count().await.is_ok());
    wait_for_convergence(&cluster, &[0, 1, 2, 3]).await;

    assert_eq!(engine.distributor().connect_servers().await, 4);
    engine.put_object("/after", b"back in service").await.unwrap();
    let set = engine.metadata().lookup("/after").await.unwrap().unwrap();
    let fragment = set.fragment_for_node("node-3").unwrap();
    assert!(cluster
        .serving("node-3")
        .unwrap()
        .store()
        .contains(fragment.id())
        .unwrap());

    // With replica 1 gone, agreement needs the recovered replica
    cluster.crash(1);
    assert_eq!(engine.get_object("/after").await.unwrap().as_ref(), b"back in service");
    assert_eq!(engine.get_object("/before").await.unwrap().as_ref(), b"all four");

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operations_continue_after_view_installation() {
    let config = cluster_config();
    let cluster = ReplicaCluster::start(&config).unwrap();
    let engine = StorageEngine::from_config(&config, cluster.storage_servers().unwrap()).unwrap();
    engine.connect().await.unwrap();
    engine.put_object("/before", b"view 0").await.unwrap();

    let executed = wait_for_convergence(&cluster, &[0, 1, 2, 3]).await;
    cluster.install_view(1, executed + 1);

    engine.put_object("/after", b"view 1").await.unwrap();
    assert_eq!(engine.get_object("/before").await.unwrap().as_ref(), b"view 0");
    assert_eq!(engine.get_object("/after").await.unwrap().as_ref(), b"view 1");
    assert!(cluster.stats().iter().all(|s| s.view == 1));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sled_replicas_persist_across_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = cluster_config();
    for node in &mut config.storage.nodes {
        node.backend = BackendKind::Sled;
        node.data_dir = Some(dir.path().join(&node.id));
    }

    let payload = generate_payload(4 * 1024);
    {
        let cluster = ReplicaCluster::start(&config).unwrap();
        let engine =
            StorageEngine::from_config(&config, cluster.storage_servers().unwrap()).unwrap();
        engine.connect().await.unwrap();
        engine.put_object("/durable", &payload).await.unwrap();
        engine.disconnect().await.unwrap();
        cluster.shutdown().await;
    }

    let cluster = ReplicaCluster::start(&config).unwrap();
    let engine = StorageEngine::from_config(&config, cluster.storage_servers().unwrap()).unwrap();
    engine.connect().await.unwrap();
    assert_eq!(engine.list(None).await.unwrap(), vec!["/durable"]);
    assert_eq!(engine.get_object("/durable").await.unwrap().as_ref(), payload.as_slice());

    cluster.shutdown().await;
}
