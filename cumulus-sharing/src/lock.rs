//! Named advisory locks.
//!
//! Locks are coarse read/write mutexes keyed by a string. They serialize
//! jobs touching the same resource within one process; there is no
//! cross-peer locking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Name of the lock guarding the shared-document index of a domain.
pub fn shared_lock_name(domain: &str) -> String {
    format!("{domain}/shared")
}

/// Name of the lock held by the uploader of a sharing.
pub fn upload_lock_name(domain: &str, sharing_id: &str) -> String {
    format!("{domain}/sharings/{sharing_id}/upload")
}

/// Name of the lock held by the replicator of a sharing.
pub fn replicate_lock_name(domain: &str, sharing_id: &str) -> String {
    format!("{domain}/sharings/{sharing_id}/replicate")
}

/// Name of the lock guarding lifecycle changes of a sharing.
pub fn sharing_lock_name(domain: &str, sharing_id: &str) -> String {
    format!("{domain}/sharings/{sharing_id}")
}

/// Hands out named read/write locks.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, name: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map refers to an entry nobody holds or waits for.
        locks.retain(|key, lock| key == name || Arc::strong_count(lock) > 1);
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Number of named locks currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for exclusive access to `name`.
    pub async fn write(&self, name: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock(name).write_owned().await
    }

    /// Waits for shared access to `name`.
    pub async fn read(&self, name: &str) -> OwnedRwLockReadGuard<()> {
        self.lock(name).read_owned().await
    }

    /// Exclusive access to `name`, or `None` if someone holds it.
    pub fn try_write(&self, name: &str) -> Option<OwnedRwLockWriteGuard<()>> {
        self.lock(name).try_write_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_names() {
        assert_eq!(shared_lock_name("alice.example"), "alice.example/shared");
        assert_eq!(
            upload_lock_name("alice.example", "abc"),
            "alice.example/sharings/abc/upload"
        );
    }

    #[tokio::test]
    async fn write_excludes_other_writers() {
        let locks = LockManager::new();
        let guard = locks.write("a").await;
        assert!(locks.try_write("a").is_none());
        assert!(locks.try_write("b").is_some());
        drop(guard);
        assert!(locks.try_write("a").is_some());
    }

    #[tokio::test]
    async fn released_locks_are_forgotten() {
        let locks = LockManager::new();
        let held = locks.write("sharings/a").await;
        drop(locks.write("sharings/b").await);
        let _c = locks.write("sharings/c").await;
        assert_eq!(locks.len(), 2);

        drop(held);
        drop(locks.read("sharings/d").await);
        assert_eq!(locks.len(), 2);
        assert!(locks.try_write("sharings/a").is_some());
    }

    #[tokio::test]
    async fn readers_share() {
        let locks = LockManager::new();
        let _r1 = locks.read("a").await;
        let _r2 = locks.read("a").await;
        assert!(locks.try_write("a").is_none());
    }
}
