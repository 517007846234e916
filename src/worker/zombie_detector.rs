use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::{ConfigHandle, WatchConfig};
use crate::error::{Result, WatchError};
use crate::model::WorkKind;
use crate::reclaim::{ReclaimSummary, Reclaimer};
use crate::registry::ExecutionRegistry;
use crate::store::{Store, WorkQuery};
use crate::worker::control::{worker_channel, RunState, Signals, Wake, WorkerHandle};

/// What one zombie check found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ZombieReport {
    /// Candidates seen in the first sample.
    pub first_sample: usize,
    /// Candidates seen in the second sample.
    pub second_sample: usize,
    /// Present in both samples and reclaimed.
    pub confirmed: Vec<Uuid>,
    pub reclaimed: ReclaimSummary,
    /// The check was interrupted by terminate between samples.
    pub aborted: bool,
}

/// Catches work this node claims in the store but is not actually running,
/// e.g. a worker that died without recording completion while the node's
/// heartbeat stays healthy.
pub struct ZombieDetector {
    store: Arc<dyn Store>,
    registry: ExecutionRegistry,
    config: ConfigHandle,
}

impl ZombieDetector {
    pub fn new(store: Arc<dyn Store>, registry: ExecutionRegistry, config: ConfigHandle) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Run one double-sampled check with the current configuration.
    pub async fn run_cycle(&self) -> Result<ZombieReport> {
        self.check(None).await
    }

    async fn check(&self, signals: Option<&Signals>) -> Result<ZombieReport> {
        let config = self.config.current();
        let mut report = ZombieReport::default();

        // A failed ping means no liveness judgement this cycle.
        self.store.ping().await?;

        let first = self.sample(&config).await?;
        report.first_sample = first.len();
        if first.is_empty() {
            return Ok(report);
        }

        // Work can be claimed in the store a moment before its executor
        // registers it. Only ids missing from both samples are zombies.
        let gap = config.zombie_sample_gap();
        match signals {
            Some(signals) => {
                if signals.pause(gap).await == Wake::Terminated {
                    report.aborted = true;
                    return Ok(report);
                }
            }
            None => tokio::time::sleep(gap).await,
        }

        let second = self.sample(&config).await?;
        report.second_sample = second.len();

        let mut resumable = Vec::new();
        let mut terminal = Vec::new();
        for (id, kind) in &first {
            if second.get(id) != Some(kind) {
                continue;
            }
            if kind.is_resumable() {
                resumable.push(*id);
            } else {
                terminal.push(*id);
            }
        }
        resumable.sort();
        terminal.sort();

        if resumable.is_empty() && terminal.is_empty() {
            return Ok(report);
        }

        tracing::warn!(
            host = %config.host_id,
            requests = resumable.len(),
            task_runs = terminal.len(),
            "Found work claimed by this node that is not executing"
        );
        report.confirmed = resumable.iter().chain(terminal.iter()).copied().collect();

        let reclaimer = Reclaimer::new(
            self.store.clone(),
            config.host_id.clone(),
            config.lock_timeout(),
        );
        report.reclaimed = reclaimer
            .reclaim_by_ids(&config.host_id, &resumable, true)
            .await?;
        report
            .reclaimed
            .merge(reclaimer.reclaim_by_ids(&config.host_id, &terminal, false).await?);

        Ok(report)
    }

    /// Ids the store says run here, minus those the registry knows about.
    async fn sample(&self, config: &WatchConfig) -> Result<HashMap<Uuid, WorkKind>> {
        self.store.decache().await;
        let claimed = self
            .store
            .query_work(&WorkQuery::running_on(config.host_id.clone()))
            .await?;
        let executing = self.registry.currently_executing();

        Ok(claimed
            .into_iter()
            .filter(|w| !executing.contains(&w.id))
            .map(|w| (w.id, w.kind))
            .collect())
    }

    pub async fn run(self, mut signals: Signals) {
        tracing::info!(host = %self.config.current().host_id, "Zombie detector running");
        loop {
            let config = signals.config();
            if signals.run_state() == RunState::Running {
                match self.check(Some(&signals)).await {
                    Ok(report) => {
                        if report.aborted {
                            break;
                        }
                        if !report.confirmed.is_empty() {
                            tracing::info!(
                                released = report.reclaimed.released.len(),
                                terminated = report.reclaimed.terminated.len(),
                                failed = report.reclaimed.failed.len(),
                                "Zombie check complete"
                            );
                        }
                    }
                    Err(WatchError::StoreUnavailable(reason)) => {
                        tracing::warn!(reason = %reason, "Store unavailable, skipping zombie check");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Zombie check failed");
                    }
                }
            }

            if signals.sleep(config.zombie_check_interval()).await == Wake::Terminated {
                break;
            }
        }
        tracing::info!("Zombie detector terminating");
    }

    pub fn spawn(self) -> WorkerHandle {
        let (signals, control) = worker_channel("zombie-detector", &self.config);
        let task = tokio::spawn(self.run(signals));
        WorkerHandle::from_task(control, task)
    }
}
