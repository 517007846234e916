//! Heartbeat emitter tests.
//!
//! These tests verify the local stamp, its counters, and the emitter's
//! start / suspend / terminate lifecycle on both execution modes.


use std::time::Duration;

use hostwatch::config::ConfigHandle;
use hostwatch::model::{COUNTER_EXECUTING_WORK, COUNTER_HEARTBEATS};
use hostwatch::registry::ExecutionRegistry;
use hostwatch::store::Store;
use hostwatch::worker::{HeartbeatEmitter, RunState};
use test_harness::{test_config, wait_for, TestCluster};
use uuid::Uuid;

/// Test 1: First beat bootstraps the node record
#[tokio::test]
async fn test_first_beat_bootstraps_record() {
    let cluster = TestCluster::new();
    let registry = ExecutionRegistry::new();
    let _a = registry.register(Uuid::new_v4());
    let _b = registry.register(Uuid::new_v4());
    let emitter = cluster.emitter("host-a", registry);

    assert!(cluster.store.get_node("host-a").await.unwrap().is_none());
    emitter.beat().await.unwrap();

    let record = cluster.node("host-a").await;
    assert_eq!(record.last_heartbeat, Some(cluster.store.now().await.unwrap()));
    assert!(!record.inactive);
    assert_eq!(record.counters.get(COUNTER_EXECUTING_WORK), Some(2));
    assert_eq!(record.counters.get(COUNTER_HEARTBEATS), Some(1));
    assert_eq!(emitter.counter().get(), 1);
}

/// Test 2: Each beat advances the stamp to the store's current time
#[tokio::test]
async fn test_beat_advances_stamp() {
    let cluster = TestCluster::new();
    let emitter = cluster.emitter("host-a", ExecutionRegistry::new());

    emitter.beat().await.unwrap();
    let first = cluster.node("host-a").await.last_heartbeat.unwrap();

    cluster.advance(Duration::from_secs(10));
    emitter.beat().await.unwrap();
    let second = cluster.node("host-a").await.last_heartbeat.unwrap();

    assert_eq!(second - first, chrono::Duration::seconds(10));
    assert_eq!(emitter.counter().get(), 2);
    assert_eq!(
        cluster.node("host-a").await.counters.get(COUNTER_HEARTBEATS),
        Some(2)
    );
}

/// Test 3: A stamp ahead of schedule is still written
#[tokio::test]
async fn test_early_beat_still_stamps() {
    let cluster = TestCluster::new();
    let emitter = cluster.emitter("host-a", ExecutionRegistry::new());

    emitter.beat().await.unwrap();
    cluster.advance(Duration::from_secs(1));
    emitter.beat().await.unwrap();

    assert_eq!(emitter.counter().get(), 2);
    assert_eq!(
        cluster.node("host-a").await.last_heartbeat,
        Some(cluster.store.now().await.unwrap())
    );
}

/// Test 4: A beat on a node marked inactive brings it back
#[tokio::test]
async fn test_beat_reactivates_node() {
    let cluster = TestCluster::new();
    cluster.seed_node("host-a", Duration::from_secs(300)).await;
    let detector = cluster.detector("host-b");
    cluster.heartbeat("host-b").await;
    detector.run_cycle().await.unwrap();
    assert!(cluster.node("host-a").await.inactive);

    let emitter = cluster.emitter("host-a", ExecutionRegistry::new());
    emitter.beat().await.unwrap();

    let record = cluster.node("host-a").await;
    assert!(!record.inactive, "Heartbeat should reactivate the node");
    assert_eq!(record.counters.get(COUNTER_HEARTBEATS), Some(1));
}

/// Test 5: A failed beat does not count
#[tokio::test]
async fn test_failed_beat_not_counted() {
    let cluster = TestCluster::new();
    let emitter = cluster.emitter("host-a", ExecutionRegistry::new());

    cluster.store.set_available(false);
    assert!(emitter.beat().await.is_err());
    assert_eq!(emitter.counter().get(), 0);

    cluster.store.set_available(true);
    emitter.beat().await.unwrap();
    assert_eq!(emitter.counter().get(), 1);
}

/// Test 6: Running worker stamps every interval, stops while suspended and
/// restarts its counter on resume
#[tokio::test(start_paused = true)]
async fn test_worker_suspend_resume() {
    let cluster = TestCluster::new();
    let emitter = cluster.emitter("host-a", ExecutionRegistry::new());
    let counter = emitter.counter();
    let handle = emitter.spawn();

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(counter.get(), 3, "Beats at 0s, 10s and 20s");

    handle.suspend();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.control().run_state(), RunState::Suspended);
    let suspended_at = counter.get();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(counter.get(), suspended_at, "No beats while suspended");

    handle.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(counter.get(), 1, "Counter restarts on resume");

    handle.shutdown().await;
}

/// Test 7: Terminate stops the worker for good
#[tokio::test(start_paused = true)]
async fn test_worker_terminate() {
    let cluster = TestCluster::new();
    let emitter = cluster.emitter("host-a", ExecutionRegistry::new());
    let counter = emitter.counter();
    let handle = emitter.spawn();

    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.terminate();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(handle.is_finished());

    let beats = counter.get();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(counter.get(), beats);
}

/// Test 8: A new interval takes effect without restarting the worker
#[tokio::test(start_paused = true)]
async fn test_worker_picks_up_config_change() {
    let cluster = TestCluster::new();
    let config = ConfigHandle::new(test_config("host-a"));
    let emitter = HeartbeatEmitter::new(
        cluster.shared_store(),
        ExecutionRegistry::new(),
        config.clone(),
    );
    let counter = emitter.counter();
    let handle = emitter.spawn();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(counter.get(), 1);

    config
        .modify(|c| c.heartbeat_interval_ms = 1_000)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    assert!(
        counter.get() >= 6,
        "Expected beats every second after the change, got {}",
        counter.get()
    );

    handle.shutdown().await;
}

/// Test 9: The store keeps failing and the worker keeps going
#[tokio::test(start_paused = true)]
async fn test_worker_survives_store_outage() {
    let cluster = TestCluster::new();
    let emitter = cluster.emitter("host-a", ExecutionRegistry::new());
    let counter = emitter.counter();

    cluster.store.set_available(false);
    let handle = emitter.spawn();
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(counter.get(), 0);
    assert!(!handle.is_finished());

    cluster.store.set_available(true);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(counter.get() >= 1);

    handle.shutdown().await;
}

/// Test 10: Dedicated heartbeat thread keeps stamping
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dedicated_thread_heartbeat() {
    let cluster = TestCluster::new();
    let emitter = cluster.emitter_with(
        test_config("host-a").with_heartbeat_interval_ms(20),
        ExecutionRegistry::new(),
    );
    let counter = emitter.counter();
    let handle = emitter.spawn_dedicated().unwrap();

    let beating = wait_for(
        || {
            let counter = counter.clone();
            async move { counter.get() >= 3 }
        },
        Duration::from_secs(5),
        Duration::from_millis(10),
    )
    .await;
    assert!(beating, "Dedicated heartbeat should stamp repeatedly");

    handle.shutdown().await;
    let beats = counter.get();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.get(), beats, "No beats after shutdown");
}

/// Test 11: A suspend followed at once by a start still restarts the counter
#[tokio::test(start_paused = true)]
async fn test_quick_suspend_resume_restarts_counter() {
    let cluster = TestCluster::new();
    let emitter = cluster.emitter("host-a", ExecutionRegistry::new());
    let counter = emitter.counter();
    let handle = emitter.spawn();

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(counter.get(), 3);

    // Both edges land before the worker wakes up.
    handle.suspend();
    handle.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.control().run_state(), RunState::Running);
    assert_eq!(counter.get(), 1, "Counter restarts on a quick resume");

    handle.shutdown().await;
}
