use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{ConfigHandle, WatchConfig};
use crate::error::{Result, WatchError};
use crate::reclaim::{ReclaimSummary, Reclaimer};
use crate::store::{NodeQuery, Store};
use crate::worker::control::{worker_channel, RunState, Signals, Wake, WorkerHandle};
use crate::worker::heartbeat::HeartbeatCounter;

/// What one crash detection cycle found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    /// Crash detection is switched off in the configuration.
    pub disabled: bool,
    /// Peers this detector moved from live to inactive.
    pub deactivated: Vec<String>,
    /// Stale peers another detector had already handled.
    pub already_inactive: Vec<String>,
    /// Stale peers whose record was locked by someone else.
    pub contended: Vec<String>,
    /// Peers that stamped a heartbeat between the query and the lock.
    pub revived: Vec<String>,
    /// Peers that are only a single beat late. Advisory only.
    pub missed_heartbeat: Vec<String>,
    /// Inactive peers from earlier cycles that still had requests to reset.
    pub swept: Vec<String>,
    pub reclaimed: ReclaimSummary,
}

enum Transition {
    Deactivated,
    AlreadyInactive,
    Contended,
    Revived,
    Vanished,
}

/// Finds peers whose heartbeat has gone stale and, exactly once per crash,
/// marks them inactive and releases their resumable work.
pub struct CrashDetector {
    store: Arc<dyn Store>,
    config: ConfigHandle,
    heartbeats: HeartbeatCounter,
}

impl CrashDetector {
    /// `heartbeats` is the counter of this process's own heartbeat emitter.
    pub fn new(store: Arc<dyn Store>, config: ConfigHandle, heartbeats: HeartbeatCounter) -> Self {
        Self {
            store,
            config,
            heartbeats,
        }
    }

    /// Run a single detection pass with the current configuration.
    ///
    /// Fails only when the store cannot be reached at all, in which case
    /// nothing was flagged. Per-candidate problems are logged and skipped.
    pub async fn run_cycle(&self) -> Result<DetectionReport> {
        let config = self.config.current();
        let mut report = DetectionReport::default();

        if !config.crash_detection_enabled {
            report.disabled = true;
            return Ok(report);
        }

        // Never judge liveness without a working view of the store.
        self.store.ping().await?;
        let now = self.store.now().await?;
        let local = config.host_id.as_str();

        let stale = self
            .late_hosts(now, config.staleness_threshold())
            .await?;

        for host in &stale {
            if host == local {
                // Our own record can look stale if this pass runs before the
                // emitter's first stamp. Only complain once it has stamped.
                if self.heartbeats.get() > 0 {
                    tracing::error!(host = %host, "Heartbeat thinks its own node crashed");
                }
                continue;
            }

            let cutoff = now - to_chrono(config.staleness_threshold());
            match self.deactivate(host, local, cutoff, &config).await {
                Ok(Transition::Deactivated) => {
                    report.deactivated.push(host.clone());
                    // Reclaim only after the node row is committed and
                    // unlocked; reclaim commits its own transactions.
                    let reclaimer =
                        Reclaimer::new(self.store.clone(), local, config.lock_timeout());
                    match reclaimer.reclaim_by_host(host).await {
                        Ok(summary) => report.reclaimed.merge(summary),
                        Err(e) => {
                            tracing::error!(dead_host = %host, error = %e, "Failed to reset requests for crashed node");
                        }
                    }
                }
                Ok(Transition::AlreadyInactive) => report.already_inactive.push(host.clone()),
                Ok(Transition::Contended) => report.contended.push(host.clone()),
                Ok(Transition::Revived) => report.revived.push(host.clone()),
                Ok(Transition::Vanished) => {}
                Err(e) => {
                    tracing::error!(host = %local, candidate = %host, error = %e, "Error while checking stale node");
                }
            }
        }

        self.sweep_inactive(local, &config, &mut report).await;

        // Diagnostics only: who is merely a beat behind.
        let flagged: HashSet<&String> = stale.iter().collect();
        match self
            .late_hosts(now, config.missed_heartbeat_threshold())
            .await
        {
            Ok(late) => {
                report.missed_heartbeat = late
                    .into_iter()
                    .filter(|h| !flagged.contains(h))
                    .collect();
                if !report.missed_heartbeat.is_empty() {
                    tracing::warn!(hosts = ?report.missed_heartbeat, "Nodes missed a heartbeat");
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Missed heartbeat diagnostic query failed");
            }
        }

        Ok(report)
    }

    /// Retry reclaim for peers declared dead in an earlier cycle. Items a
    /// previous reclaim skipped or failed on are still claimed by a host that
    /// will never run them.
    async fn sweep_inactive(&self, local: &str, config: &WatchConfig, report: &mut DetectionReport) {
        self.store.decache().await;
        let inactive = match self.store.query_nodes(&NodeQuery::inactive()).await {
            Ok(hosts) => hosts,
            Err(e) => {
                tracing::warn!(error = %e, "Inactive node query failed, skipping sweep");
                return;
            }
        };

        let reclaimer = Reclaimer::new(self.store.clone(), local, config.lock_timeout());
        for host in inactive {
            // Deactivated peers were reclaimed a moment ago. Local work is
            // the zombie detector's business.
            if host == local || report.deactivated.contains(&host) {
                continue;
            }
            match reclaimer.reclaim_by_host(&host).await {
                Ok(summary) if !summary.is_empty() => {
                    report.swept.push(host);
                    report.reclaimed.merge(summary);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(dead_host = %host, error = %e, "Failed to sweep requests of inactive node");
                }
            }
        }
    }

    async fn late_hosts(&self, now: DateTime<Utc>, threshold: Duration) -> Result<Vec<String>> {
        // Make sure no lingering cached rows hide a fresh stamp.
        self.store.decache().await;
        let query = NodeQuery::stale_since(now - to_chrono(threshold));
        self.store.query_nodes(&query).await
    }

    /// The live -> inactive transition, done entirely under the row lock.
    async fn deactivate(
        &self,
        host: &str,
        local: &str,
        cutoff: DateTime<Utc>,
        config: &WatchConfig,
    ) -> Result<Transition> {
        self.store.decache().await;
        let mut lock = match self.store.lock_node(host, config.lock_timeout()).await {
            Ok(Some(lock)) => lock,
            Ok(None) => return Ok(Transition::Vanished),
            Err(WatchError::LockTimeout { .. }) => {
                tracing::debug!(candidate = %host, "Unable to lock node, another detector is handling it");
                return Ok(Transition::Contended);
            }
            Err(e) => return Err(e),
        };

        if lock.inactive {
            tracing::info!(candidate = %host, "Another detector deactivated node");
            return Ok(Transition::AlreadyInactive);
        }
        if lock.last_heartbeat.map_or(false, |last| last >= cutoff) {
            tracing::info!(candidate = %host, "Node heartbeated again before it could be deactivated");
            return Ok(Transition::Revived);
        }

        tracing::error!(host = %local, candidate = %host, "Deactivating crashed node");
        lock.deactivate();
        self.store.commit_node(lock).await?;
        Ok(Transition::Deactivated)
    }

    pub async fn run(self, mut signals: Signals) {
        tracing::info!(host = %self.config.current().host_id, "Crash detector running");
        loop {
            let config = signals.config();
            if signals.run_state() == RunState::Running {
                match self.run_cycle().await {
                    Ok(report) => {
                        if !report.deactivated.is_empty() || !report.swept.is_empty() {
                            tracing::info!(
                                deactivated = ?report.deactivated,
                                swept = ?report.swept,
                                released = report.reclaimed.released.len(),
                                "Crash detection cycle complete"
                            );
                        }
                    }
                    Err(WatchError::StoreUnavailable(reason)) => {
                        tracing::warn!(reason = %reason, "Store unavailable, skipping crash detection cycle");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Crash detection cycle failed");
                    }
                }
            }

            if signals.sleep(config.detector_interval()).await == Wake::Terminated {
                break;
            }
        }
        tracing::info!("Crash detector terminating");
    }

    pub fn spawn(self) -> WorkerHandle {
        let (signals, control) = worker_channel("crash-detector", &self.config);
        let task = tokio::spawn(self.run(signals));
        WorkerHandle::from_task(control, task)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}
