//! Releasing or terminating work whose owner is no longer executing it.
//!
//! Every item is locked, re-read and committed on its own. A failure partway
//! through a batch only leaves the unprocessed remainder untouched, and those
//! items are picked up again by the next detector cycle since their claim is
//! still visibly broken.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{WorkItem, WorkKind};
use crate::store::{Store, WorkQuery};

/// What a reclaim pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimSummary {
    /// Resumable items whose ownership was cleared.
    pub released: Vec<Uuid>,
    /// Non-resumable items marked completed with a terminated status.
    pub terminated: Vec<Uuid>,
    /// Items left alone because someone else already handled them, or
    /// their lock could not be taken this time.
    pub skipped: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

impl ReclaimSummary {
    pub fn reclaimed(&self) -> usize {
        self.released.len() + self.terminated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reclaimed() == 0 && self.skipped.is_empty() && self.failed.is_empty()
    }

    pub fn merge(&mut self, other: ReclaimSummary) {
        self.released.extend(other.released);
        self.terminated.extend(other.terminated);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}

enum Outcome {
    Released,
    Terminated,
    Skipped,
}

/// Stateless reclaim operations over the shared store.
#[derive(Clone)]
pub struct Reclaimer {
    store: Arc<dyn Store>,
    local_host: String,
    lock_timeout: Duration,
}

impl Reclaimer {
    pub fn new(store: Arc<dyn Store>, local_host: impl Into<String>, lock_timeout: Duration) -> Self {
        Self {
            store,
            local_host: local_host.into(),
            lock_timeout,
        }
    }

    /// Release every resumable item a dead host still claims.
    ///
    /// Task runs owned by the host are deliberately left alone here. The
    /// owning process is gone, and re-running partial non-idempotent work is
    /// worse than leaving it visibly unfinished.
    pub async fn reclaim_by_host(&self, host: &str) -> Result<ReclaimSummary> {
        self.store.decache().await;
        let query = WorkQuery::owned_by(host)
            .of_kind(WorkKind::Request)
            .live_only();
        let ids: Vec<Uuid> = self
            .store
            .query_work(&query)
            .await?
            .into_iter()
            .map(|w| w.id)
            .collect();

        if ids.is_empty() {
            tracing::debug!(dead_host = %host, "No orphan requests to reset");
            return Ok(ReclaimSummary::default());
        }

        tracing::info!(
            host = %self.local_host,
            dead_host = %host,
            count = ids.len(),
            "Resetting orphan requests"
        );
        self.reclaim_by_ids(host, &ids, true).await
    }

    /// Reclaim an explicit set of items that `owner` claims but is not running.
    ///
    /// Resumable items have their ownership cleared. Non-resumable items are
    /// marked completed with a terminated status.
    pub async fn reclaim_by_ids(
        &self,
        owner: &str,
        ids: &[Uuid],
        resumable: bool,
    ) -> Result<ReclaimSummary> {
        let mut summary = ReclaimSummary::default();
        if ids.is_empty() {
            return Ok(summary);
        }

        let now = self.store.now().await?;
        for &id in ids {
            match self.reclaim_one(owner, id, resumable, now).await {
                Ok(Outcome::Released) => summary.released.push(id),
                Ok(Outcome::Terminated) => summary.terminated.push(id),
                Ok(Outcome::Skipped) => summary.skipped.push(id),
                Err(e) if e.is_lock_timeout() => {
                    tracing::debug!(work_id = %id, "Work item locked elsewhere, leaving it for a later cycle");
                    summary.skipped.push(id);
                }
                Err(e) => {
                    tracing::warn!(work_id = %id, error = %e, "Failed to reclaim work item");
                    summary.failed.push(id);
                }
            }
        }

        Ok(summary)
    }

    /// Clean up everything a previous process on `host` left claimed.
    ///
    /// Only safe before this process starts executing work, since every
    /// owned item is assumed orphaned.
    pub async fn reclaim_orphans_at_startup(&self, host: &str) -> Result<ReclaimSummary> {
        self.store.decache().await;
        let owned = self.store.query_work(&WorkQuery::owned_by(host)).await?;

        let (requests, runs): (Vec<WorkItem>, Vec<WorkItem>) =
            owned.into_iter().partition(|w| w.kind.is_resumable());
        let request_ids: Vec<Uuid> = requests.iter().map(|w| w.id).collect();
        let run_ids: Vec<Uuid> = runs.iter().map(|w| w.id).collect();

        let mut summary = self.reclaim_by_ids(host, &request_ids, true).await?;
        summary.merge(self.reclaim_by_ids(host, &run_ids, false).await?);

        if summary.reclaimed() > 0 {
            tracing::warn!(
                host = %host,
                released = summary.released.len(),
                terminated = summary.terminated.len(),
                "Cleaned up orphaned work from a previous run"
            );
        }
        Ok(summary)
    }

    async fn reclaim_one(
        &self,
        owner: &str,
        id: Uuid,
        resumable: bool,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let Some(mut item) = self.store.lock_work(id, self.lock_timeout).await? else {
            tracing::debug!(work_id = %id, "Work item no longer exists");
            return Ok(Outcome::Skipped);
        };

        // Double-check under the lock; another reclaimer or the owner itself
        // may have moved the item on since it was queried.
        if item.owner_host.as_deref() != Some(owner) {
            tracing::info!(work_id = %id, name = %item.name, "Already reset by another thread");
            return Ok(Outcome::Skipped);
        }
        if item.is_complete() {
            tracing::info!(work_id = %id, name = %item.name, "Already completed, aborting reset");
            return Ok(Outcome::Skipped);
        }
        if item.kind.is_resumable() != resumable {
            tracing::warn!(work_id = %id, kind = %item.kind, "Work kind does not match reclaim request");
            return Ok(Outcome::Skipped);
        }

        let outcome = if resumable {
            tracing::warn!(work_id = %id, name = %item.name, owner = %owner, "Resetting crashed request");
            item.release();
            Outcome::Released
        } else {
            tracing::warn!(work_id = %id, name = %item.name, owner = %owner, "Terminating orphaned task run");
            item.terminate(now);
            Outcome::Terminated
        };

        self.store.commit_work(item).await?;
        Ok(outcome)
    }
}

/// Mark `host` inactive right away on a graceful shutdown, so peers do not
/// have to wait out the staleness threshold. Returns false if the host has
/// no record.
pub async fn mark_node_inactive(store: &dyn Store, host: &str) -> Result<bool> {
    let Some(mut record) = store.get_node(host).await? else {
        return Ok(false);
    };
    record.deactivate();
    store.save_node(&record).await?;
    tracing::info!(host = %host, "Marked node inactive for shutdown");
    Ok(true)
}
