use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::repositories::EntityKey;

type LockMap = DashMap<EntityKey, Arc<Mutex<()>>>;

/// Per-entity async mutexes serializing every mutation of one record.
/// Entries live only while some caller holds or waits on them.
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: Arc<LockMap>,
}

/// Held locks; released on drop, and idle entries are evicted.
#[must_use]
#[derive(Debug)]
pub struct LockSet {
    guards: Vec<OwnedMutexGuard<()>>,
    keys: Vec<EntityKey>,
    map: Arc<LockMap>,
}

impl LockSet {
    pub fn keys(&self) -> &[EntityKey] {
        &self.keys
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.guards.clear();
        // `entry` and `remove_if` share the shard lock, so a waiter that
        // cloned the handle keeps the entry alive.
        for key in &self.keys {
            self.map.remove_if(key, |_, m| Arc::strong_count(m) == 1);
        }
    }
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &EntityKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Locks every key in sorted order so overlapping callers cannot deadlock.
    pub async fn lock_many<I>(&self, keys: I) -> LockSet
    where
        I: IntoIterator<Item = EntityKey>,
    {
        let mut keys: Vec<EntityKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let handle = self.handle(key);
            guards.push(handle.lock_owned().await);
        }

        LockSet {
            guards,
            keys,
            map: self.locks.clone(),
        }
    }

    pub async fn lock(&self, key: EntityKey) -> LockSet {
        self.lock_many([key]).await
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
