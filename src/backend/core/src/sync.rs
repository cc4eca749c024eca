//! Keyed async mutual exclusion.
//!
//! [`KeyedLocks`] hands out one async mutex per key, created on demand and
//! dropped again once nobody holds or waits on it, so the map only contains
//! keys that are in use.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A set of async locks addressed by key.
#[derive(Debug)]
pub struct KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait until the lock for `key` is free and take it.
    ///
    /// Dropping the returned future mid-wait still releases the map entry.
    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        // Clone under the shard lock so cleanup never races a new waiter.
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let mut held = KeyedGuard {
            locks: &self.locks,
            key: Some(key),
            guard: None,
        };
        held.guard = Some(mutex.lock_owned().await);
        held
    }

    /// Take the lock for `key` only if nobody holds it.
    pub fn try_lock(&self, key: K) -> Option<KeyedGuard<'_, K>> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let mut held = KeyedGuard {
            locks: &self.locks,
            key: Some(key),
            guard: None,
        };
        held.guard = Some(mutex.try_lock_owned().ok()?);
        Some(held)
    }

    /// Keys with a holder or a waiter.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Holds the lock for one key until dropped.
pub struct KeyedGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    key: Option<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyedGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        // Release first so the map's Arc is the only one left if nobody waits.
        drop(self.guard.take());
        if let Some(key) = self.key.take() {
            self.locks
                .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}
