//! Short-lived cache of the sharings the dispatcher consults.

use crate::sharing::Sharing;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// TTL cache of active sharings, keyed by doctype.
///
/// The engine evicts it whenever a sharing is saved.
#[derive(Debug)]
pub struct SharingCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, Arc<Vec<Sharing>>)>>,
}

impl SharingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached value if it has not expired.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<Sharing>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, sharings)| Arc::clone(sharings))
    }

    pub fn set(&self, key: &str, sharings: Vec<Sharing>) -> Arc<Vec<Sharing>> {
        let sharings = Arc::new(sharings);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), (Instant::now(), Arc::clone(&sharings)));
        sharings
    }

    pub fn evict(&self, key: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
    }
}
