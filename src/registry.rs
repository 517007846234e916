use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

/// Process-wide set of work item ids that are actually executing here.
///
/// The execution engine adds an id when it starts a unit and removes it when
/// the unit finishes or is interrupted. The zombie detector only reads it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRegistry {
    executing: Arc<RwLock<HashSet<Uuid>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` for as long as the returned guard lives.
    pub fn register(&self, id: Uuid) -> ExecutionGuard {
        self.insert(id);
        ExecutionGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Returns false if the id was already registered.
    pub fn insert(&self, id: Uuid) -> bool {
        self.write().insert(id)
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        self.write().remove(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.read().contains(id)
    }

    /// Snapshot of everything currently executing in this process.
    pub fn currently_executing(&self) -> HashSet<Uuid> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // The set stays consistent even if a holder panicked, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashSet<Uuid>> {
        self.executing.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashSet<Uuid>> {
        self.executing.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes its id from the registry when dropped, including on unwind.
#[derive(Debug)]
pub struct ExecutionGuard {
    registry: ExecutionRegistry,
    id: Uuid,
}

impl ExecutionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}
