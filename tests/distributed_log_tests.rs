//! Replication tests for the distributed log: a three-node Raft cluster
//! over loopback, using the multiplexed transport without TLS.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use scrivener::api::Record;
use scrivener::cluster::{DistributedConfig, DistributedLog, StreamLayer, RAFT_RPC};
use scrivener::error::{ClusterError, LogError};
use scrivener::storage::LogConfig;

struct TestNode {
    log: Arc<DistributedLog>,
    addr: String,
    name: String,
}

/// Start one node: a muxed listener on an ephemeral port plus the
/// replicated log behind it.
async fn start_node(name: &str, dir: &std::path::Path, bootstrap: bool) -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let stream_layer = StreamLayer::new(None, None);

    let log = DistributedLog::new(
        dir,
        stream_layer.clone(),
        DistributedConfig {
            node_name: name.to_string(),
            rpc_addr: addr.clone(),
            bootstrap,
            segment: LogConfig {
                max_store_bytes: 64 * 1024,
                max_index_bytes: 64 * 1024,
                initial_offset: 0,
            },
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let serve_log = Arc::clone(&log);
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let stream_layer = stream_layer.clone();
            let log = Arc::clone(&serve_log);
            tokio::spawn(async move {
                let mut tag = [0u8; 1];
                if stream.read_exact(&mut tag).await.is_err() || tag[0] != RAFT_RPC {
                    return;
                }
                if let Ok(conn) = stream_layer.accept_raft(stream, tag[0]).await {
                    let _ = log.serve_raft_connection(conn).await;
                }
            });
        }
    });

    TestNode {
        log,
        addr,
        name: name.to_string(),
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never held within {deadline:?}: {what}");
}

async fn three_node_cluster(dir: &std::path::Path) -> Vec<TestNode> {
    let leader = start_node("node-0", &dir.join("node-0"), true).await;
    leader
        .log
        .wait_for_leader(Duration::from_secs(3))
        .await
        .unwrap();

    let mut nodes = vec![leader];
    for i in 1..3 {
        let name = format!("node-{i}");
        let node = start_node(&name, &dir.join(&name), false).await;
        nodes[0].log.join(&node.name, &node.addr).await.unwrap();
        nodes.push(node);
    }
    nodes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_replication() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = three_node_cluster(dir.path()).await;

    let payloads: [&[u8]; 2] = [b"first", b"second"];
    for (i, payload) in payloads.iter().enumerate() {
        let offset = nodes[0]
            .log
            .append(Record::new(payload.to_vec()))
            .await
            .unwrap();
        assert_eq!(offset, i as u64);
    }

    // Followers converge onto every record at the produced offset.
    for node in &nodes[1..] {
        for (i, payload) in payloads.iter().enumerate() {
            let log = Arc::clone(&node.log);
            eventually(
                &format!("{} replicates offset {i}", node.name),
                Duration::from_secs(3),
                move || {
                    log.read(i as u64)
                        .map(|record| record.value == *payload)
                        .unwrap_or(false)
                },
            )
            .await;
        }
    }

    for node in &nodes {
        node.log.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_append_on_follower_is_not_leader() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = three_node_cluster(dir.path()).await;

    // Drive one append through so the cluster is live, and give the
    // follower a moment to learn the leader.
    nodes[0]
        .log
        .append(Record::new(b"live".to_vec()))
        .await
        .unwrap();
    let follower = Arc::clone(&nodes[1].log);
    eventually(
        "follower applies the first record",
        Duration::from_secs(3),
        {
            let follower = Arc::clone(&follower);
            move || follower.read(0).is_ok()
        },
    )
    .await;

    let err = follower.append(Record::new(b"nope".to_vec())).await;
    assert!(
        matches!(err, Err(ClusterError::NotLeader)),
        "expected NotLeader, got {err:?}"
    );

    for node in &nodes {
        node.log.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_evicted_node_stops_converging() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = three_node_cluster(dir.path()).await;

    let offset = nodes[0]
        .log
        .append(Record::new(b"before".to_vec()))
        .await
        .unwrap();
    for node in &nodes[1..] {
        let log = Arc::clone(&node.log);
        eventually(
            &format!("{} replicates the first record", node.name),
            Duration::from_secs(3),
            move || log.read(offset).is_ok(),
        )
        .await;
    }

    // Evict node-1, then append again.
    nodes[0].log.leave("node-1").await.unwrap();
    let offset = nodes[0]
        .log
        .append(Record::new(b"after".to_vec()))
        .await
        .unwrap();

    // node-2 still converges.
    let log2 = Arc::clone(&nodes[2].log);
    eventually(
        "node-2 replicates the post-eviction record",
        Duration::from_secs(3),
        move || log2.read(offset).is_ok(),
    )
    .await;

    // node-1 no longer receives entries.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let err = nodes[1].log.read(offset);
    assert!(
        matches!(
            err,
            Err(ClusterError::Log(LogError::OffsetOutOfRange { .. }))
        ),
        "expected OffsetOutOfRange on the evicted node, got {err:?}"
    );

    for node in &nodes {
        node.log.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = three_node_cluster(dir.path()).await;

    // Re-joining with the same id and address changes nothing.
    nodes[0]
        .log
        .join("node-1", &nodes[1].addr)
        .await
        .unwrap();

    let offset = nodes[0]
        .log
        .append(Record::new(b"still-works".to_vec()))
        .await
        .unwrap();
    let log1 = Arc::clone(&nodes[1].log);
    eventually(
        "node-1 replicates after re-join",
        Duration::from_secs(3),
        move || log1.read(offset).is_ok(),
    )
    .await;

    for node in &nodes {
        node.log.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_restart_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let node_dir = dir.path().join("node-0");
    let offset;
    {
        let node = start_node("node-0", &node_dir, true).await;
        node.log
            .wait_for_leader(Duration::from_secs(3))
            .await
            .unwrap();
        offset = node
            .log
            .append(Record::new(b"durable".to_vec()))
            .await
            .unwrap();
        node.log.close().await.unwrap();
    }

    // Same data dir, bootstrap flag still set: prior state wins and the
    // record is still readable.
    let node = start_node("node-0", &node_dir, true).await;
    node.log
        .wait_for_leader(Duration::from_secs(3))
        .await
        .unwrap();
    let log = Arc::clone(&node.log);
    eventually("record survives restart", Duration::from_secs(3), move || {
        log.read(offset)
            .map(|r| r.value == b"durable")
            .unwrap_or(false)
    })
    .await;
    node.log.close().await.unwrap();
}
