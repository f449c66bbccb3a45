use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// Reader/writer locks keyed by sidecar path.
///
/// Locks are created on demand and dropped once nobody holds them anymore, so the table only grows
/// with the number of keys accessed concurrently.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<PathBuf, Weak<RwLock<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `key`. Hold on to it while holding one of its guards.
    pub fn get(&self, key: &Path) -> KeyLock {
        let mut slot = self.locks.entry(key.to_path_buf()).or_insert_with(Weak::new);
        if let Some(lock) = slot.upgrade() {
            return KeyLock(lock);
        }
        let lock = Arc::new(RwLock::new(()));
        *slot = Arc::downgrade(&lock);
        // retain locks every shard, including the one guarded by `slot`.
        drop(slot);
        self.locks.retain(|_, lock| lock.strong_count() > 0);
        KeyLock(lock)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

pub struct KeyLock(Arc<RwLock<()>>);

impl KeyLock {
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}
