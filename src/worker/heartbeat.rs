use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio::runtime::Runtime;

use crate::config::{ConfigHandle, WatchConfig};
use crate::error::{Result, WatchError};
use crate::model::{NodeRecord, ResourceCounters, COUNTER_EXECUTING_WORK, COUNTER_HEARTBEATS};
use crate::registry::ExecutionRegistry;
use crate::store::Store;
use crate::worker::control::{worker_channel, RunState, Signals, Wake, WorkerHandle};

/// Number of heartbeats stamped since the emitter was last started.
///
/// A crash detector in the same process reads this to tell "my own record
/// looks stale because I have not stamped yet" apart from a real problem.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatCounter(Arc<AtomicU64>);

impl HeartbeatCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// Keeps the local host's `last_heartbeat` advancing at a fixed cadence.
pub struct HeartbeatEmitter {
    store: Arc<dyn Store>,
    registry: ExecutionRegistry,
    config: ConfigHandle,
    counter: HeartbeatCounter,
}

impl HeartbeatEmitter {
    pub fn new(store: Arc<dyn Store>, registry: ExecutionRegistry, config: ConfigHandle) -> Self {
        Self {
            store,
            registry,
            config,
            counter: HeartbeatCounter::new(),
        }
    }

    pub fn counter(&self) -> HeartbeatCounter {
        self.counter.clone()
    }

    /// Stamp the local node record once.
    ///
    /// No lock is taken: until a crash is declared the owner is the only
    /// writer of its own record.
    pub async fn beat(&self) -> Result<NodeRecord> {
        let config = self.config.current();
        self.beat_with(&config).await
    }

    async fn beat_with(&self, config: &WatchConfig) -> Result<NodeRecord> {
        let host = config.host_id.as_str();
        let now = self.store.now().await?;

        let mut record = match self.store.get_node(host).await? {
            Some(record) => {
                tracing::debug!(host = %host, "Server heartbeat");
                if let Some(last) = record.last_heartbeat {
                    // Scheduler wake-ups jitter, so only a stamp well ahead of
                    // schedule counts as early.
                    let expected = last
                        + ChronoDuration::milliseconds(config.heartbeat_interval_ms as i64)
                        - ChronoDuration::milliseconds(config.jitter_tolerance_ms as i64);
                    if expected > now {
                        tracing::warn!(
                            host = %host,
                            last = %last,
                            now = %now,
                            expected = %expected,
                            "Early heartbeat, another process may be running with the same host id"
                        );
                    }
                }
                record
            }
            None => {
                tracing::info!(host = %host, "Bootstrapping node record");
                NodeRecord::new(host)
            }
        };

        let mut counters = ResourceCounters::new();
        counters.set(COUNTER_EXECUTING_WORK, self.registry.len() as i64);
        counters.set(COUNTER_HEARTBEATS, self.counter.get() as i64 + 1);
        record.stamp(now, counters);

        self.store.save_node(&record).await?;
        self.counter.increment();
        Ok(record)
    }

    /// Heartbeat loop. Errors are logged and followed by the normal sleep so
    /// a broken store never turns into a tight retry loop.
    pub async fn run(self, mut signals: Signals) {
        let host = self.config.current().host_id;
        tracing::info!(host = %host, "Heartbeat worker running");

        let mut seen_resumes = signals.resumes();
        loop {
            let config = signals.config();

            if signals.run_state() == RunState::Running {
                // A suspend and resume can both land within one sleep, so
                // compare resume counts rather than observed states.
                let resumes = signals.resumes();
                if resumes != seen_resumes {
                    tracing::info!(host = %config.host_id, "Resuming heartbeat");
                    self.counter.reset();
                    seen_resumes = resumes;
                }
                if let Err(e) = self.beat_with(&config).await {
                    tracing::error!(host = %config.host_id, error = %e, "Exception during heartbeat cycle");
                }
            }

            tracing::debug!(
                host = %config.host_id,
                interval_ms = config.heartbeat_interval_ms,
                "Heartbeat sleeping"
            );
            if signals.sleep(config.heartbeat_interval()).await == Wake::Terminated {
                break;
            }
        }

        tracing::info!(host = %host, "Heartbeat worker terminating");
    }

    /// Run on the caller's runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (signals, control) = worker_channel("heartbeat", &self.config);
        let task = tokio::spawn(self.run(signals));
        WorkerHandle::from_task(control, task)
    }

    /// Run on a dedicated OS thread with its own single-threaded runtime, so
    /// slow work on the shared runtime cannot delay a stamp.
    ///
    /// Returns only once the runtime is up. A node must not start without a
    /// working heartbeat.
    pub fn spawn_dedicated(self) -> Result<WorkerHandle> {
        self.spawn_on_thread(|| {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        })
    }

    fn spawn_on_thread<F>(self, build: F) -> Result<WorkerHandle>
    where
        F: FnOnce() -> io::Result<Runtime> + Send + 'static,
    {
        let (signals, control) = worker_channel("heartbeat", &self.config);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                let runtime = match build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                runtime.block_on(self.run(signals));
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(WorkerHandle::from_thread(control, thread)),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to build heartbeat runtime");
                Err(WatchError::Io(e))
            }
            Err(_) => Err(WatchError::Io(io::Error::new(
                io::ErrorKind::Other,
                "heartbeat thread exited before its runtime started",
            ))),
        }
    }
}
