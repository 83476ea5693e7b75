// End-to-end scenarios over an in-process cluster: a real master and real
// storage nodes on ephemeral ports, talking the framed protocol.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use chunkfs::client::DfsClient;
use chunkfs::config::{CommonConfig, MasterConfig, NodeConfig};
use chunkfs::error::DfsError;
use chunkfs::master_impl;
use chunkfs::master_service::MasterService;
use chunkfs::node_impl;
use chunkfs::node_service::NodeService;
use chunkfs::protocol::{sha256_hex, NodeStatus};

fn fast_common() -> CommonConfig {
    CommonConfig {
        block_size: 1024,
        replication_factor: 2,
        heartbeat_interval: 1,
        node_timeout: 3,
        failure_check_interval: 1,
        ..CommonConfig::default()
    }
}

struct TestMaster {
    service: Arc<MasterService>,
    config: MasterConfig,
}

async fn start_master(dir: &Path, common: &CommonConfig) -> TestMaster {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = MasterConfig {
        host: "127.0.0.1".to_string(),
        port,
        metadata_path: dir.join("dfs_metadata.json").to_string_lossy().to_string(),
        ..MasterConfig::default()
    };
    let service = MasterService::new(config.clone(), common.clone());
    service.start_failure_detector();
    tokio::spawn(master_impl::serve(Arc::clone(&service), listener));
    TestMaster { service, config }
}

struct TestNode {
    service: Arc<NodeService>,
    serve_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
}

impl TestNode {
    /// Simulates a crash: the listener and the heartbeat emitter both stop.
    fn kill(&self) {
        self.serve_handle.abort();
        self.heartbeat_handle.abort();
    }
}

async fn start_node(
    node_id: &str,
    storage_root: &Path,
    master_config: &MasterConfig,
    common: &CommonConfig,
) -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let node_config = NodeConfig {
        storage_root: storage_root.to_string_lossy().to_string(),
        ..NodeConfig::default()
    };
    let service =
        NodeService::new(node_id, port, &node_config, master_config, common.clone()).unwrap();
    let heartbeat_handle = service.start_heartbeat_emitter();
    let serve_handle = tokio::spawn(node_impl::serve(Arc::clone(&service), listener));
    TestNode {
        service,
        serve_handle,
        heartbeat_handle,
    }
}

async fn wait_for_online(service: &Arc<MasterService>, expected: usize) {
    for _ in 0..100 {
        {
            let state = service.state.read().await;
            let online = state
                .nodes
                .values()
                .filter(|record| record.status == NodeStatus::Online)
                .count();
            if online == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("expected {} online nodes", expected);
}

async fn wait_for_offline(service: &Arc<MasterService>, node_ids: &[String]) {
    for _ in 0..150 {
        {
            let state = service.state.read().await;
            if node_ids
                .iter()
                .all(|node_id| state.nodes[node_id].status == NodeStatus::Offline)
            {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("nodes {:?} never went offline", node_ids);
}

fn write_payload(dir: &Path, name: &str, len: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.join(name), &payload).unwrap();
    payload
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_download_round_trip() {
    let dir = TempDir::new().unwrap();
    let common = fast_common();
    let master = start_master(dir.path(), &common).await;

    let storage_root = dir.path().join("storage");
    let mut nodes = Vec::new();
    for i in 1..=3 {
        nodes.push(
            start_node(
                &format!("node_{}", i),
                &storage_root,
                &master.config,
                &common,
            )
            .await,
        );
    }
    wait_for_online(&master.service, 3).await;

    // 2500 bytes at a 1024-byte block size spans 3 chunks.
    let payload = write_payload(dir.path(), "data.bin", 2500);
    let client = DfsClient::new(&master.config, &common);
    client.upload_file(&dir.path().join("data.bin")).await.unwrap();

    let files = client.list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filename, "data.bin");
    assert_eq!(files[0].size, 2500);
    assert_eq!(files[0].status, "Available");

    {
        let state = master.service.state.read().await;
        let chunks = &state.files["data.bin"].chunks;
        assert_eq!(chunks.len(), 3);
        for chunk_id in chunks {
            let locations = &state.chunk_locations[chunk_id];
            assert_eq!(locations.len(), 2);
            assert_ne!(locations[0], locations[1]);
        }
    }

    let dest = dir.path().join("out.bin");
    client.download_file("data.bin", &dest).await.unwrap();
    let read_back = std::fs::read(&dest).unwrap();
    assert_eq!(read_back, payload);
    assert_eq!(sha256_hex(&read_back), sha256_hex(&payload));
    assert!(!dir.path().join("out.bin.part").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replication_after_node_failure() {
    let dir = TempDir::new().unwrap();
    let common = fast_common();
    let master = start_master(dir.path(), &common).await;

    let storage_root = dir.path().join("storage");
    let mut nodes = Vec::new();
    for i in 1..=3 {
        nodes.push(
            start_node(
                &format!("node_{}", i),
                &storage_root,
                &master.config,
                &common,
            )
            .await,
        );
    }
    wait_for_online(&master.service, 3).await;

    write_payload(dir.path(), "tiny.bin", 1);
    let client = DfsClient::new(&master.config, &common);
    client.upload_file(&dir.path().join("tiny.bin")).await.unwrap();

    let (chunk_id, victim_id) = {
        let state = master.service.state.read().await;
        let chunk_id = state.files["tiny.bin"].chunks[0].clone();
        let victim_id = state.chunk_locations[&chunk_id][0].clone();
        (chunk_id, victim_id)
    };

    nodes
        .iter()
        .find(|node| node.service.node_id == victim_id)
        .unwrap()
        .kill();

    // Within node_timeout + one detector tick + transfer time the chunk is
    // back to two ONLINE replicas: the survivor plus a fresh destination.
    let mut recovered = false;
    for _ in 0..300 {
        {
            let state = master.service.state.read().await;
            let locations = &state.chunk_locations[&chunk_id];
            let online = locations
                .iter()
                .filter(|node_id| state.nodes[*node_id].status == NodeStatus::Online)
                .count();
            if online == 2 {
                assert!(!locations.contains(&victim_id));
                recovered = true;
            }
        }
        if recovered {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(recovered, "chunk was not re-replicated");

    let dest = dir.path().join("tiny.out");
    client.download_file("tiny.bin", &dest).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), vec![0u8]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_with_no_online_nodes() {
    let dir = TempDir::new().unwrap();
    let common = fast_common();
    let master = start_master(dir.path(), &common).await;

    write_payload(dir.path(), "data.bin", 10);
    let client = DfsClient::new(&master.config, &common);
    let result = client.upload_file(&dir.path().join("data.bin")).await;
    match result {
        Err(DfsError::Remote(message)) => assert_eq!(message, "No online nodes"),
        other => panic!("expected remote error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_unavailable_when_all_replicas_offline() {
    let dir = TempDir::new().unwrap();
    let common = fast_common();
    let master = start_master(dir.path(), &common).await;

    let storage_root = dir.path().join("storage");
    let mut nodes = Vec::new();
    for i in 1..=2 {
        nodes.push(
            start_node(
                &format!("node_{}", i),
                &storage_root,
                &master.config,
                &common,
            )
            .await,
        );
    }
    wait_for_online(&master.service, 2).await;

    write_payload(dir.path(), "data.bin", 100);
    let client = DfsClient::new(&master.config, &common);
    client.upload_file(&dir.path().join("data.bin")).await.unwrap();

    for node in &nodes {
        node.kill();
    }
    wait_for_offline(
        &master.service,
        &["node_1".to_string(), "node_2".to_string()],
    )
    .await;

    let result = client
        .download_file("data.bin", &dir.path().join("out.bin"))
        .await;
    match result {
        Err(DfsError::Remote(message)) => assert_eq!(message, "Data unavailable"),
        other => panic!("expected remote error, got {:?}", other.map(|_| ())),
    }
    assert!(!dir.path().join("out.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_recovers_metadata() {
    let dir = TempDir::new().unwrap();
    let common = fast_common();
    let master = start_master(dir.path(), &common).await;

    let storage_root = dir.path().join("storage");
    let mut nodes = Vec::new();
    for i in 1..=2 {
        nodes.push(
            start_node(
                &format!("node_{}", i),
                &storage_root,
                &master.config,
                &common,
            )
            .await,
        );
    }
    wait_for_online(&master.service, 2).await;

    let client = DfsClient::new(&master.config, &common);
    write_payload(dir.path(), "one.bin", 100);
    write_payload(dir.path(), "two.bin", 2000);
    client.upload_file(&dir.path().join("one.bin")).await.unwrap();
    client.upload_file(&dir.path().join("two.bin")).await.unwrap();

    // A fresh master over the same metadata path lists both files before
    // any heartbeat arrives.
    let restarted = start_master(dir.path(), &common).await;
    let client2 = DfsClient::new(&restarted.config, &common);
    let mut files = client2.list_files().await.unwrap();
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    assert_eq!(files.len(), 2);
    assert_eq!((files[0].filename.as_str(), files[0].size), ("one.bin", 100));
    assert_eq!((files[1].filename.as_str(), files[1].size), ("two.bin", 2000));

    // Bring the nodes back against the restarted master (same ids and
    // storage, fresh ports). Once they heartbeat, downloads succeed.
    let mut restarted_nodes = Vec::new();
    for i in 1..=2 {
        restarted_nodes.push(
            start_node(
                &format!("node_{}", i),
                &storage_root,
                &restarted.config,
                &common,
            )
            .await,
        );
    }
    wait_for_online(&restarted.service, 2).await;
    let dest = dir.path().join("one.out");
    client2.download_file("one.bin", &dest).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap().len(), 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_frees_node_storage() {
    let dir = TempDir::new().unwrap();
    let common = fast_common();
    let master = start_master(dir.path(), &common).await;

    let storage_root = dir.path().join("storage");
    let mut nodes = Vec::new();
    for i in 1..=3 {
        nodes.push(
            start_node(
                &format!("node_{}", i),
                &storage_root,
                &master.config,
                &common,
            )
            .await,
        );
    }
    wait_for_online(&master.service, 3).await;

    write_payload(dir.path(), "data.bin", 2500);
    let client = DfsClient::new(&master.config, &common);
    client.upload_file(&dir.path().join("data.bin")).await.unwrap();

    // Replicas are on disk before the delete.
    let stored: usize = nodes
        .iter()
        .map(|node| std::fs::read_dir(&node.service.storage_path).unwrap().count())
        .sum();
    assert_eq!(stored, 6); // 3 chunks * 2 replicas

    client.delete_file("data.bin").await.unwrap();
    assert!(client.list_files().await.unwrap().is_empty());

    // Node-side cleanup is asynchronous but prompt.
    let mut cleaned = false;
    for _ in 0..50 {
        let remaining: usize = nodes
            .iter()
            .map(|node| std::fs::read_dir(&node.service.storage_path).unwrap().count())
            .sum();
        if remaining == 0 {
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(cleaned, "chunk files were not cleaned up");

    // File-level delete is not idempotent.
    let result = client.delete_file("data.bin").await;
    match result {
        Err(DfsError::Remote(message)) => assert_eq!(message, "File not found"),
        other => panic!("expected remote error, got {:?}", other.map(|_| ())),
    }
}
