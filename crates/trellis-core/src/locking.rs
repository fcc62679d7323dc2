//! Per-key async locking
//!
//! Operations on the same plugin id must not interleave (two installs of the
//! same plugin racing on payment and cache writes, for example). A
//! [`KeyedMutex`] hands out one async mutex per key; unrelated keys never
//! contend. Entries are dropped from the map once nobody holds or waits on
//! them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Error, Result};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// A map of independent async mutexes keyed by string
#[derive(Debug, Clone, Default)]
pub struct KeyedMutex {
    locks: Arc<Mutex<LockMap>>,
}

/// Guard for one key; the lock is released when dropped
#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until the lock for `key` is available
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = self.entry(key);
        let guard = mutex.lock_owned().await;
        debug!(lock_key = %key, "Keyed lock acquired");
        KeyedGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Like [`lock`](Self::lock) but gives up after `timeout`
    pub async fn lock_timeout(&self, key: &str, timeout: Duration) -> Result<KeyedGuard> {
        match tokio::time::timeout(timeout, self.lock(key)).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                self.prune(key);
                Err(Error::LockTimeout(key.to_string()))
            }
        }
    }

    /// Acquire without waiting; `None` if the key is held
    pub fn try_lock(&self, key: &str) -> Option<KeyedGuard> {
        let mutex = self.entry(key);
        match mutex.try_lock_owned() {
            Ok(guard) => Some(KeyedGuard {
                key: key.to_string(),
                guard: Some(guard),
                locks: self.locks.clone(),
            }),
            Err(_) => None,
        }
    }

    /// Whether `key` is currently held
    pub fn is_locked(&self, key: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.get(key).is_some_and(|m| m.try_lock().is_err())
    }

    /// Number of keys with a live entry (held or awaited)
    pub fn active_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn prune(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        remove_if_idle(&mut locks, key);
    }
}

fn remove_if_idle(locks: &mut LockMap, key: &str) {
    if locks.get(key).is_some_and(|m| Arc::strong_count(m) == 1) {
        locks.remove(key);
    }
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // Release before inspecting the refcount
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        remove_if_idle(&mut locks, &self.key);
    }
}
