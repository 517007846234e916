use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{ConfigHandle, WatchConfig};
use crate::error::Result;
use crate::reclaim::{mark_node_inactive, Reclaimer};
use crate::registry::ExecutionRegistry;
use crate::store::Store;
use crate::worker::{
    CrashDetector, HeartbeatCounter, HeartbeatEmitter, WorkerHandle, ZombieDetector,
};

/// One cluster member: wires the shared store and the in-process execution
/// registry into the three coordination workers.
pub struct ClusterNode {
    config: ConfigHandle,
    store: Arc<dyn Store>,
    registry: ExecutionRegistry,
    dedicated_heartbeat: bool,
}

impl ClusterNode {
    pub fn new(
        config: WatchConfig,
        store: Arc<dyn Store>,
        registry: ExecutionRegistry,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: ConfigHandle::new(config),
            store,
            registry,
            dedicated_heartbeat: true,
        })
    }

    /// Run the heartbeat on the shared runtime instead of its own thread.
    pub fn with_shared_heartbeat(mut self) -> Self {
        self.dedicated_heartbeat = false;
        self
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.registry
    }

    /// Start all workers.
    ///
    /// 1. Cleans up work a previous process on this host left claimed
    /// 2. Starts the heartbeat, on a dedicated thread unless disabled
    /// 3. Starts the crash detector and the zombie detector
    ///
    /// Must run before the execution engine picks up work, since step 1
    /// treats everything this host owns as orphaned.
    pub async fn start(&self) -> Result<RunningNode> {
        let host = self.config.current().host_id;
        let config = self.config.current();

        let reclaimer = Reclaimer::new(self.store.clone(), host.clone(), config.lock_timeout());
        if let Err(e) = reclaimer.reclaim_orphans_at_startup(&host).await {
            tracing::warn!(host = %host, error = %e, "Startup orphan cleanup failed");
        }

        let emitter = HeartbeatEmitter::new(
            self.store.clone(),
            self.registry.clone(),
            self.config.clone(),
        );
        let heartbeats = emitter.counter();
        let heartbeat = if self.dedicated_heartbeat {
            emitter.spawn_dedicated()?
        } else {
            emitter.spawn()
        };

        let crash_detector =
            CrashDetector::new(self.store.clone(), self.config.clone(), heartbeats.clone())
                .spawn();
        let zombie_detector = ZombieDetector::new(
            self.store.clone(),
            self.registry.clone(),
            self.config.clone(),
        )
        .spawn();

        tracing::info!(host = %host, "Node started");
        Ok(RunningNode {
            host,
            store: self.store.clone(),
            heartbeats,
            heartbeat,
            crash_detector,
            zombie_detector,
        })
    }

    /// Run until `shutdown` is cancelled, then stop the workers and mark this
    /// host inactive.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let running = self.start().await?;
        shutdown.cancelled().await;
        running.shutdown().await
    }
}

/// Handles to a started node's workers.
pub struct RunningNode {
    host: String,
    store: Arc<dyn Store>,
    heartbeats: HeartbeatCounter,
    heartbeat: WorkerHandle,
    crash_detector: WorkerHandle,
    zombie_detector: WorkerHandle,
}

impl RunningNode {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn heartbeats(&self) -> &HeartbeatCounter {
        &self.heartbeats
    }

    pub fn heartbeat(&self) -> &WorkerHandle {
        &self.heartbeat
    }

    pub fn crash_detector(&self) -> &WorkerHandle {
        &self.crash_detector
    }

    pub fn zombie_detector(&self) -> &WorkerHandle {
        &self.zombie_detector
    }

    /// Suspend every worker, e.g. around a maintenance window.
    pub fn suspend(&self) {
        self.heartbeat.suspend();
        self.crash_detector.suspend();
        self.zombie_detector.suspend();
    }

    pub fn resume(&self) {
        self.heartbeat.start();
        self.crash_detector.start();
        self.zombie_detector.start();
    }

    /// Graceful stop: terminate the workers, then mark this host inactive so
    /// peers need not wait out the staleness threshold.
    pub async fn shutdown(self) -> Result<()> {
        let store = self.store.clone();
        let host = self.host.clone();
        self.halt().await;
        mark_node_inactive(store.as_ref(), &host).await?;
        Ok(())
    }

    /// Stop the workers without touching the node record, which is what a
    /// killed process looks like to its peers.
    pub async fn halt(self) {
        tokio::join!(
            self.heartbeat.shutdown(),
            self.crash_detector.shutdown(),
            self.zombie_detector.shutdown(),
        );
        tracing::info!(host = %self.host, "Node workers stopped");
    }
}
