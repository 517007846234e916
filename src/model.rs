use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Gauge names written into [`NodeRecord::counters`].
pub const COUNTER_EXECUTING_WORK: &str = "executing_work";
pub const COUNTER_HEARTBEATS: &str = "heartbeats";

/// Message attached to non-resumable work that was terminated by a reclaim.
pub const TERMINATED_MESSAGE: &str = "Terminated: owning worker is no longer executing this run";

/// Diagnostic gauges published with each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounters(BTreeMap<String, i64>);

impl ResourceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: i64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }

    /// Keep the gauge names but report nothing running.
    pub fn zero(&mut self) {
        for value in self.0.values_mut() {
            *value = 0;
        }
    }

    pub fn is_zeroed(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &i64)> {
        self.0.iter()
    }
}

/// Persisted liveness record, one per host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub host_id: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub inactive: bool,
    pub counters: ResourceCounters,
}

impl NodeRecord {
    /// Bootstrap a record for a host that has never heartbeated.
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            last_heartbeat: None,
            inactive: false,
            counters: ResourceCounters::new(),
        }
    }

    /// Record a liveness stamp. A stamp always reactivates the host.
    pub fn stamp(&mut self, now: DateTime<Utc>, counters: ResourceCounters) {
        self.last_heartbeat = Some(now);
        self.inactive = false;
        self.counters = counters;
    }

    /// The live -> inactive transition performed once per crash.
    pub fn deactivate(&mut self) {
        self.inactive = true;
        self.counters.zero();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkKind {
    /// A queued request. Can be restarted from scratch elsewhere.
    Request,
    /// A task run. Holds partial, non-restartable execution state.
    TaskRun,
}

impl WorkKind {
    pub fn is_resumable(self) -> bool {
        matches!(self, WorkKind::Request)
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkKind::Request => write!(f, "request"),
            WorkKind::TaskRun => write!(f, "task_run"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Success,
    Error,
    Terminated,
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionStatus::Success => write!(f, "success"),
            CompletionStatus::Error => write!(f, "error"),
            CompletionStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// A unit of asynchronous work with an owning host and completion state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub kind: WorkKind,
    pub name: String,
    pub owner_host: Option<String>,
    pub launched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Only meaningful for requests: the item is intentionally idle until then.
    pub rescheduled_for: Option<DateTime<Utc>>,
    pub live: bool,
    pub completion: Option<CompletionStatus>,
    pub messages: Vec<String>,
}

impl WorkItem {
    pub fn new(kind: WorkKind, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            name: name.into(),
            owner_host: None,
            launched_at: None,
            completed_at: None,
            rescheduled_for: None,
            live: true,
            completion: None,
            messages: Vec::new(),
        }
    }

    pub fn request(name: impl Into<String>) -> Self {
        Self::new(WorkKind::Request, name)
    }

    pub fn task_run(name: impl Into<String>) -> Self {
        Self::new(WorkKind::TaskRun, name)
    }

    /// Claim the item for a host, as the dispatch layer does.
    pub fn claim(&mut self, host: impl Into<String>, at: DateTime<Utc>) {
        self.owner_host = Some(host.into());
        self.launched_at = Some(at);
        self.live = true;
    }

    pub fn complete(&mut self, at: DateTime<Utc>, status: CompletionStatus) {
        self.completed_at = Some(at);
        self.completion = Some(status);
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// True when the persisted state says this item is executing on its owner
    /// right now.
    pub fn claims_running(&self) -> bool {
        self.owner_host.is_some()
            && self.launched_at.is_some()
            && self.completed_at.is_none()
            && self.live
            && !(self.kind.is_resumable() && self.rescheduled_for.is_some())
    }

    /// Release ownership so the dispatcher can hand the item out again.
    pub fn release(&mut self) {
        self.owner_host = None;
        self.launched_at = None;
    }

    /// Close out a run that cannot be restarted.
    pub fn terminate(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.completion = Some(CompletionStatus::Terminated);
        self.live = false;
        self.messages.push(TERMINATED_MESSAGE.to_string());
    }
}
