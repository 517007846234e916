//! Boundary to the shared persistent store.
//!
//! The store is the only state shared between nodes. Everything the
//! coordination workers know about peers and work comes from here, and the
//! only cross-node ordering guarantee is the row lock taken by
//! [`Store::lock_node`].
//!
//! # Components
//!
//! - [`Store`]: the operations the workers consume
//! - [`NodeQuery`] / [`WorkQuery`]: predicates over node and work rows
//! - [`RowLock`]: a row read under a pessimistic lock, released on commit or drop
//! - [`memory::MemoryStore`]: in-process implementation used by the simulator and tests

pub mod memory;

use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{NodeRecord, WorkItem, WorkKind};

pub use memory::MemoryStore;

/// Predicate over node records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeQuery {
    /// Match records whose last heartbeat is strictly older than this.
    pub heartbeat_before: Option<DateTime<Utc>>,
    pub inactive: Option<bool>,
}

impl NodeQuery {
    /// Active records that have not heartbeated since `before`.
    pub fn stale_since(before: DateTime<Utc>) -> Self {
        Self {
            heartbeat_before: Some(before),
            inactive: Some(false),
        }
    }

    /// Every record already declared dead or shut down.
    pub fn inactive() -> Self {
        Self {
            heartbeat_before: None,
            inactive: Some(true),
        }
    }

    pub fn matches(&self, record: &NodeRecord) -> bool {
        if let Some(before) = self.heartbeat_before {
            // A record that never heartbeated compares like a SQL null.
            match record.last_heartbeat {
                Some(last) if last < before => {}
                _ => return false,
            }
        }
        if let Some(inactive) = self.inactive {
            if record.inactive != inactive {
                return false;
            }
        }
        true
    }
}

/// Predicate over work items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkQuery {
    pub owner_host: Option<String>,
    pub kind: Option<WorkKind>,
    /// Only items with no completion timestamp.
    pub incomplete: bool,
    pub live: Option<bool>,
    /// Skip requests that are intentionally idle until a later time.
    pub exclude_rescheduled: bool,
}

impl WorkQuery {
    /// Items owned by `host` that have not completed.
    pub fn owned_by(host: impl Into<String>) -> Self {
        Self {
            owner_host: Some(host.into()),
            incomplete: true,
            ..Default::default()
        }
    }

    /// Items the store believes are executing on `host` right now.
    pub fn running_on(host: impl Into<String>) -> Self {
        Self {
            owner_host: Some(host.into()),
            incomplete: true,
            live: Some(true),
            exclude_rescheduled: true,
            ..Default::default()
        }
    }

    pub fn of_kind(mut self, kind: WorkKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn live_only(mut self) -> Self {
        self.live = Some(true);
        self
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        if let Some(ref host) = self.owner_host {
            if item.owner_host.as_deref() != Some(host.as_str()) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if item.kind != kind {
                return false;
            }
        }
        if self.incomplete && item.completed_at.is_some() {
            return false;
        }
        if let Some(live) = self.live {
            if item.live != live {
                return false;
            }
        }
        if self.exclude_rescheduled && item.kind.is_resumable() && item.rescheduled_for.is_some()
        {
            return false;
        }
        true
    }
}

/// A row read under a pessimistic lock.
///
/// The lock is held until the row is handed back to the store's commit
/// method, or until this value is dropped, which releases it without writing.
pub struct RowLock<T> {
    record: T,
    _guard: Box<dyn Any + Send + Sync>,
}

impl<T> RowLock<T> {
    pub fn new(record: T, guard: impl Any + Send + Sync) -> Self {
        Self {
            record,
            _guard: Box::new(guard),
        }
    }

    pub fn record(&self) -> &T {
        &self.record
    }

    /// Split into the row and the guard that keeps the lock held.
    pub fn into_parts(self) -> (T, Box<dyn Any + Send + Sync>) {
        (self.record, self._guard)
    }
}

impl<T> Deref for RowLock<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.record
    }
}

impl<T> DerefMut for RowLock<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.record
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RowLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowLock")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// Transactional persistent store shared by every node.
///
/// Writes outside a [`RowLock`] commit immediately. Lock acquisition blocks up
/// to the supplied timeout and fails with
/// [`WatchError::LockTimeout`](crate::error::WatchError::LockTimeout).
#[async_trait]
pub trait Store: Send + Sync {
    /// The store's current time. All staleness comparisons use it.
    async fn now(&self) -> Result<DateTime<Utc>>;

    /// Trivial read used to confirm the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Drop any process-local read cache so the next read is fresh.
    async fn decache(&self);

    async fn get_node(&self, host_id: &str) -> Result<Option<NodeRecord>>;

    async fn save_node(&self, record: &NodeRecord) -> Result<()>;

    /// Host ids of the matching node records.
    async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<String>>;

    /// Lock a node record for update. `Ok(None)` if the row does not exist.
    async fn lock_node(
        &self,
        host_id: &str,
        timeout: Duration,
    ) -> Result<Option<RowLock<NodeRecord>>>;

    /// Write the locked row and release the lock.
    async fn commit_node(&self, lock: RowLock<NodeRecord>) -> Result<()>;

    async fn get_work(&self, id: Uuid) -> Result<Option<WorkItem>>;

    async fn save_work(&self, item: &WorkItem) -> Result<()>;

    async fn query_work(&self, query: &WorkQuery) -> Result<Vec<WorkItem>>;

    /// Lock a work item for update. `Ok(None)` if the row does not exist.
    async fn lock_work(&self, id: Uuid, timeout: Duration) -> Result<Option<RowLock<WorkItem>>>;

    /// Write the locked row and release the lock.
    async fn commit_work(&self, lock: RowLock<WorkItem>) -> Result<()>;
}
