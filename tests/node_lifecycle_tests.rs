//! Node lifecycle tests.
//!
//! These tests run whole nodes (heartbeat, crash detector and zombie
//! detector together) against one shared store and verify start-up cleanup,
//! graceful shutdown and detection of a killed peer.


use std::time::Duration;

use hostwatch::model::WorkItem;
use hostwatch::node::{ClusterNode, RunningNode};
use hostwatch::registry::ExecutionRegistry;
use hostwatch::store::Store;
use test_harness::{test_config, TestCluster};
use tokio_util::sync::CancellationToken;

async fn start_node(cluster: &TestCluster, host: &str, registry: ExecutionRegistry) -> RunningNode {
    ClusterNode::new(test_config(host), cluster.shared_store(), registry)
        .unwrap()
        .with_shared_heartbeat()
        .start()
        .await
        .unwrap()
}

/// Move store time and tokio time forward together, one interval at a time.
async fn run_for(cluster: &TestCluster, intervals: usize) {
    for _ in 0..intervals {
        cluster.advance(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
}

/// Test 1: Invalid configuration is rejected up front
#[tokio::test]
async fn test_invalid_config_rejected() {
    let cluster = TestCluster::new();
    let result = ClusterNode::new(
        test_config("host-a").with_heartbeat_interval_ms(0),
        cluster.shared_store(),
        ExecutionRegistry::new(),
    );
    assert!(result.is_err());
}

/// Test 2: Starting a node cleans up work its previous incarnation left
#[tokio::test(start_paused = true)]
async fn test_start_cleans_up_previous_run() {
    let cluster = TestCluster::new();
    let request = cluster.seed_request("host-a", "left-over").await;
    let run = cluster.seed_task_run("host-a", "left-over-run").await;

    let node = start_node(&cluster, "host-a", ExecutionRegistry::new()).await;

    assert!(cluster.work(request).await.owner_host.is_none());
    assert!(cluster.work(run).await.is_complete());

    node.shutdown().await.unwrap();
}

/// Test 3: Graceful shutdown stops stamping and marks the node inactive
#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_marks_inactive() {
    let cluster = TestCluster::new();
    let node = start_node(&cluster, "host-a", ExecutionRegistry::new()).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(node.heartbeats().get() >= 1);
    assert!(!cluster.node("host-a").await.inactive);

    node.shutdown().await.unwrap();
    let record = cluster.node("host-a").await;
    assert!(record.inactive);
    assert!(record.counters.is_zeroed());
}

/// Test 4: Cancelling the shutdown token stops a node started with run
#[tokio::test(start_paused = true)]
async fn test_run_until_cancelled() {
    let cluster = TestCluster::new();
    let node = ClusterNode::new(
        test_config("host-a"),
        cluster.shared_store(),
        ExecutionRegistry::new(),
    )
    .unwrap()
    .with_shared_heartbeat();

    let token = CancellationToken::new();
    let task = tokio::spawn(node.run(token.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!cluster.node("host-a").await.inactive);

    token.cancel();
    task.await.unwrap().unwrap();
    assert!(cluster.node("host-a").await.inactive);
}

/// Test 5: A killed node is flagged by its peer after the threshold and its
/// requests are released
#[tokio::test(start_paused = true)]
async fn test_killed_node_detected_by_peer() {
    let cluster = TestCluster::new();
    let node_a = start_node(&cluster, "host-a", ExecutionRegistry::new()).await;

    let registry_b = ExecutionRegistry::new();
    let node_b = start_node(&cluster, "host-b", registry_b.clone()).await;

    let now = cluster.store.now().await.unwrap();
    let mut requests = Vec::new();
    let mut guards = Vec::new();
    for i in 0..3 {
        let mut item = WorkItem::request(format!("req-{}", i));
        item.claim("host-b", now);
        cluster.store.save_work(&item).await.unwrap();
        guards.push(registry_b.register(item.id));
        requests.push(item.id);
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    // Kill host-b: its workers stop and its executors vanish with it.
    node_b.halt().await;
    drop(guards);

    run_for(&cluster, 12).await;
    assert!(
        !cluster.node("host-b").await.inactive,
        "Flagged before the threshold"
    );
    for id in &requests {
        assert_eq!(cluster.work(*id).await.owner_host.as_deref(), Some("host-b"));
    }

    run_for(&cluster, 2).await;
    let record = cluster.node("host-b").await;
    assert!(record.inactive, "Killed node should be flagged");
    for id in &requests {
        let item = cluster.work(*id).await;
        assert!(item.owner_host.is_none());
        assert!(item.launched_at.is_none());
    }

    assert!(!cluster.node("host-a").await.inactive);
    node_a.shutdown().await.unwrap();
}

/// Test 6: Suspending a node pauses its heartbeat and resuming restarts the
/// counter
#[tokio::test(start_paused = true)]
async fn test_suspend_and_resume() {
    let cluster = TestCluster::new();
    let node = start_node(&cluster, "host-a", ExecutionRegistry::new()).await;

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(node.heartbeats().get(), 3);

    node.suspend();
    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(node.heartbeats().get(), 3);

    node.resume();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(node.heartbeats().get(), 1);

    node.shutdown().await.unwrap();
}
