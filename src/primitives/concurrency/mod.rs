#![forbid(unsafe_code)]
//! Named reader/writer locks handed out by a page store.
//!
//! Trees and overflow containers lock by component name. Exclusive guards are owned by an
//! atomic operation and released only when it commits or rolls back; shared guards
//! live for a single search or cursor batch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};

/// Registry of named component locks.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

/// Guard for a shared (read) lock on a component.
pub struct SharedLock {
    name: String,
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

/// Guard for an exclusive (write) lock on a component.
pub struct ExclusiveLock {
    name: String,
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

/// Point-in-time view of one lock, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Component name.
    pub name: String,
    /// Whether any guard is currently held.
    pub locked: bool,
    /// Whether the held guard is exclusive.
    pub exclusive: bool,
}

impl LockManager {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, name: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    /// Blocks until a shared lock on `name` is granted.
    pub fn shared(&self, name: &str) -> SharedLock {
        let lock = self.lock_for(name);
        SharedLock {
            name: name.to_owned(),
            _guard: lock.read_arc(),
        }
    }

    /// Blocks until an exclusive lock on `name` is granted.
    pub fn exclusive(&self, name: &str) -> ExclusiveLock {
        let lock = self.lock_for(name);
        let guard = lock.write_arc();
        tracing::trace!(target: "pager::locks", name, "exclusive lock acquired");
        ExclusiveLock {
            name: name.to_owned(),
            _guard: guard,
        }
    }

    /// Attempts to take an exclusive lock without blocking.
    pub fn try_exclusive(&self, name: &str) -> Option<ExclusiveLock> {
        let lock = self.lock_for(name);
        let guard = lock.try_write_arc()?;
        Some(ExclusiveLock {
            name: name.to_owned(),
            _guard: guard,
        })
    }

    /// Returns the state of every lock that has been requested so far, sorted by name.
    pub fn snapshot(&self) -> Vec<LockSnapshot> {
        let locks = self.locks.lock();
        let mut out: Vec<LockSnapshot> = locks
            .iter()
            .map(|(name, lock)| LockSnapshot {
                name: name.clone(),
                locked: lock.is_locked(),
                exclusive: lock.is_locked_exclusive(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl SharedLock {
    /// Name of the locked component.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ExclusiveLock {
    /// Name of the locked component.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        tracing::trace!(target: "pager::locks", name = %self.name, "exclusive lock released");
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("locks", &self.locks.lock().len())
            .finish()
    }
}

impl fmt::Debug for SharedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedLock").field(&self.name).finish()
    }
}

impl fmt::Debug for ExclusiveLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExclusiveLock").field(&self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_blocks_other_writers_until_dropped() {
        let locks = LockManager::new();
        let guard = locks.exclusive("tree");
        assert!(locks.try_exclusive("tree").is_none());
        assert!(locks.try_exclusive("other").is_some());
        drop(guard);
        assert!(locks.try_exclusive("tree").is_some());
    }

    #[test]
    fn shared_locks_coexist_and_show_in_snapshot() {
        let locks = LockManager::new();
        let a = locks.shared("tree");
        let b = locks.shared("tree");
        assert_eq!(a.name(), "tree");
        assert!(locks.try_exclusive("tree").is_none());
        let snap = locks.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap[0].locked);
        assert!(!snap[0].exclusive);
        drop((a, b));
        assert!(!locks.snapshot()[0].locked);
    }
}
