use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, WatchError};
use crate::model::{NodeRecord, WorkItem};
use crate::store::{NodeQuery, RowLock, Store, WorkQuery};

type LockTable<K> = Mutex<HashMap<K, Arc<Mutex<()>>>>;

// Plain writes wait at most this long for a row lock held by someone else.
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// In-process store with per-row pessimistic locks.
///
/// Plain writes to a row wait for any lock held on that row, the way an
/// update blocks behind `SELECT ... FOR UPDATE` in a database.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    nodes: RwLock<HashMap<String, NodeRecord>>,
    work: RwLock<HashMap<Uuid, WorkItem>>,
    node_locks: LockTable<String>,
    work_locks: LockTable<Uuid>,
    available: AtomicBool,
    failing_work_commits: Mutex<HashSet<Uuid>>,
    node_commits: AtomicU64,
    work_commits: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            nodes: RwLock::new(HashMap::new()),
            work: RwLock::new(HashMap::new()),
            node_locks: Mutex::new(HashMap::new()),
            work_locks: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing_work_commits: Mutex::new(HashSet::new()),
            node_commits: AtomicU64::new(0),
            work_commits: AtomicU64::new(0),
        }
    }

    /// Simulate an outage. While unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every commit of the given work item fail until cleared.
    pub async fn fail_commits_for(&self, id: Uuid) {
        self.failing_work_commits.lock().await.insert(id);
    }

    pub async fn clear_commit_failures(&self) {
        self.failing_work_commits.lock().await.clear();
    }

    /// Number of node rows written, locked or not.
    pub fn node_commit_count(&self) -> u64 {
        self.node_commits.load(Ordering::SeqCst)
    }

    /// Number of work rows written, locked or not.
    pub fn work_commit_count(&self) -> u64 {
        self.work_commits.load(Ordering::SeqCst)
    }

    pub async fn all_nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        nodes
    }

    pub async fn all_work(&self) -> Vec<WorkItem> {
        self.work.read().await.values().cloned().collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WatchError::StoreUnavailable(
                "memory store is offline".to_string(),
            ))
        }
    }

    async fn acquire<K>(
        table: &LockTable<K>,
        key: K,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>>
    where
        K: std::hash::Hash + Eq + Clone + std::fmt::Display,
    {
        let row = table.lock().await.entry(key.clone()).or_default().clone();
        tokio::time::timeout(timeout, row.lock_owned())
            .await
            .map_err(|_| WatchError::LockTimeout {
                key: key.to_string(),
            })
    }

    async fn write_node(&self, record: NodeRecord) {
        self.nodes
            .write()
            .await
            .insert(record.host_id.clone(), record);
        self.node_commits.fetch_add(1, Ordering::SeqCst);
    }

    async fn write_work(&self, item: WorkItem) -> Result<()> {
        if self.failing_work_commits.lock().await.contains(&item.id) {
            return Err(WatchError::Store(format!(
                "commit rejected for work item {}",
                item.id
            )));
        }
        self.work.write().await.insert(item.id, item);
        self.work_commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn now(&self) -> Result<DateTime<Utc>> {
        self.check_available()?;
        Ok(self.clock.now())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()?;
        let _ = self.nodes.read().await.len();
        Ok(())
    }

    async fn decache(&self) {}

    async fn get_node(&self, host_id: &str) -> Result<Option<NodeRecord>> {
        self.check_available()?;
        Ok(self.nodes.read().await.get(host_id).cloned())
    }

    async fn save_node(&self, record: &NodeRecord) -> Result<()> {
        self.check_available()?;
        let _row = Self::acquire(
            &self.node_locks,
            record.host_id.clone(),
            WRITE_LOCK_TIMEOUT,
        )
        .await?;
        self.write_node(record.clone()).await;
        Ok(())
    }

    async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<String>> {
        self.check_available()?;
        let mut hosts: Vec<String> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| query.matches(n))
            .map(|n| n.host_id.clone())
            .collect();
        hosts.sort();
        Ok(hosts)
    }

    async fn lock_node(
        &self,
        host_id: &str,
        timeout: Duration,
    ) -> Result<Option<RowLock<NodeRecord>>> {
        self.check_available()?;
        let guard = Self::acquire(&self.node_locks, host_id.to_string(), timeout).await?;
        // Read only after the lock is held so the caller sees the latest commit.
        let record = self.nodes.read().await.get(host_id).cloned();
        Ok(record.map(|r| RowLock::new(r, guard)))
    }

    async fn commit_node(&self, lock: RowLock<NodeRecord>) -> Result<()> {
        self.check_available()?;
        let (record, guard) = lock.into_parts();
        self.write_node(record).await;
        drop(guard);
        Ok(())
    }

    async fn get_work(&self, id: Uuid) -> Result<Option<WorkItem>> {
        self.check_available()?;
        Ok(self.work.read().await.get(&id).cloned())
    }

    async fn save_work(&self, item: &WorkItem) -> Result<()> {
        self.check_available()?;
        let _row = Self::acquire(&self.work_locks, item.id, WRITE_LOCK_TIMEOUT).await?;
        self.write_work(item.clone()).await
    }

    async fn query_work(&self, query: &WorkQuery) -> Result<Vec<WorkItem>> {
        self.check_available()?;
        Ok(self
            .work
            .read()
            .await
            .values()
            .filter(|w| query.matches(w))
            .cloned()
            .collect())
    }

    async fn lock_work(&self, id: Uuid, timeout: Duration) -> Result<Option<RowLock<WorkItem>>> {
        self.check_available()?;
        let guard = Self::acquire(&self.work_locks, id, timeout).await?;
        let item = self.work.read().await.get(&id).cloned();
        Ok(item.map(|w| RowLock::new(w, guard)))
    }

    async fn commit_work(&self, lock: RowLock<WorkItem>) -> Result<()> {
        self.check_available()?;
        let (item, guard) = lock.into_parts();
        let result = self.write_work(item).await;
        drop(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn lock_node_times_out_while_held() {
        let store = MemoryStore::new();
        store.save_node(&NodeRecord::new("a")).await.unwrap();

        let held = store
            .lock_node("a", Duration::from_millis(50))
            .await
            .unwrap()
            .expect("row exists");

        let err = store
            .lock_node("a", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_lock_timeout());

        drop(held);
        assert!(store
            .lock_node("a", Duration::from_millis(20))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn lock_node_missing_row_is_none() {
        let store = MemoryStore::new();
        let lock = store
            .lock_node("ghost", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(lock.is_none());
    }

    #[tokio::test]
    async fn commit_node_writes_and_releases() {
        let store = MemoryStore::new();
        store.save_node(&NodeRecord::new("a")).await.unwrap();

        let mut lock = store
            .lock_node("a", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        lock.deactivate();
        store.commit_node(lock).await.unwrap();

        assert!(store.get_node("a").await.unwrap().unwrap().inactive);
        assert!(store
            .lock_node("a", Duration::from_millis(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn dropped_lock_discards_changes() {
        let store = MemoryStore::new();
        store.save_node(&NodeRecord::new("a")).await.unwrap();

        let mut lock = store
            .lock_node("a", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        lock.deactivate();
        drop(lock);

        assert!(!store.get_node("a").await.unwrap().unwrap().inactive);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_everything() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.ping().await,
            Err(WatchError::StoreUnavailable(_))
        ));
        assert!(store.now().await.is_err());
        assert!(store.query_nodes(&NodeQuery::default()).await.is_err());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn now_comes_from_clock() {
        let clock = ManualClock::default();
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let before = store.now().await.unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(
            store.now().await.unwrap() - before,
            chrono::Duration::seconds(5)
        );
    }

    #[tokio::test]
    async fn injected_commit_failure_rejects_work_write() {
        let store = MemoryStore::new();
        let item = WorkItem::request("r");
        store.save_work(&item).await.unwrap();
        store.fail_commits_for(item.id).await;

        let lock = store
            .lock_work(item.id, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(store.commit_work(lock).await.is_err());

        store.clear_commit_failures().await;
        assert!(store.save_work(&item).await.is_ok());
    }
}
