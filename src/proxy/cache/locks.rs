use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::CacheKey;

/// Per-key async mutexes serializing revalidation and writes of one cache entry.
///
/// Entries hold only weak references; a key's mutex lives as long as someone holds or waits
/// on it.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    inner: Mutex<HashMap<CacheKey, Weak<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut guard = self.inner.lock();
            match guard.get(key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    guard.retain(|_, weak| weak.strong_count() > 0);
                    let created = Arc::new(AsyncMutex::new(()));
                    guard.insert(key.clone(), Arc::downgrade(&created));
                    created
                }
            }
        };
        mutex.lock_owned().await
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
