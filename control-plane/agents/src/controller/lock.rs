use crate::errors::SvcError;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use stor_port::types::v0::transport::StorageSystemId;
use strum_macros::{AsRefStr, Display};
use tokio::{sync::Notify, time::Instant};

/// The scope a lock protects.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display, AsRefStr)]
pub enum LockScope {
    /// A logical consistency group on a storage system.
    ConsistencyGroup,
    /// An array replication group on a storage system.
    ReplicationGroup,
}

impl LockScope {
    /// Deterministic key of the scope `id` on the given storage system.
    pub fn key(&self, id: &str, system: &StorageSystemId) -> String {
        format!("{self}/{system}/{id}")
    }
}

#[derive(Debug)]
struct HeldLock {
    owner: u64,
    expires: Instant,
}

#[derive(Debug)]
struct LockTable {
    held: Mutex<HashMap<String, HeldLock>>,
    released: Notify,
    ttl: Duration,
    next_owner: Mutex<u64>,
}

/// Acquires and releases named, TTL-bounded locks.
/// All keys requested together are acquired atomically, or not at all.
#[derive(Debug, Clone)]
pub struct LockManager {
    table: Arc<LockTable>,
}

impl LockManager {
    /// Create a new `Self` whose locks expire after `ttl` if never released.
    pub fn new(ttl: Duration) -> Self {
        Self {
            table: Arc::new(LockTable {
                held: Mutex::new(HashMap::new()),
                released: Notify::new(),
                ttl,
                next_owner: Mutex::new(0),
            }),
        }
    }

    /// Acquire all `keys`, waiting up to `timeout` for conflicting holders to release them.
    /// Fails with `SvcError::ResourceBusy` on timeout, leaving none of the keys held.
    pub async fn acquire(&self, keys: &[String], timeout: Duration) -> Result<LockGuard, SvcError> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let owner = {
            let mut next = self.table.next_owner.lock();
            *next += 1;
            *next
        };
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.table.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.try_acquire(&keys, owner) {
                Ok(()) => {
                    tracing::trace!(?keys, "Locks acquired");
                    return Ok(LockGuard {
                        manager: self.clone(),
                        keys,
                        owner,
                    });
                }
                Err(expires) => expires.min(deadline),
            };
            if Instant::now() >= deadline {
                tracing::warn!(?keys, ?timeout, "Timed out acquiring locks");
                return Err(SvcError::ResourceBusy { keys, timeout });
            }
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    /// Take all keys if none is held by someone else, otherwise return the earliest
    /// expiry among the conflicting holders.
    fn try_acquire(&self, keys: &[String], owner: u64) -> Result<(), Instant> {
        let now = Instant::now();
        let mut held = self.table.held.lock();

        let conflict = keys
            .iter()
            .filter_map(|key| held.get(key))
            .filter(|lock| lock.owner != owner && lock.expires > now)
            .map(|lock| lock.expires)
            .min();
        if let Some(expires) = conflict {
            return Err(expires);
        }

        for key in keys {
            if held.contains_key(key) {
                tracing::warn!(key, "Taking over an expired lock");
            }
            held.insert(
                key.clone(),
                HeldLock {
                    owner,
                    expires: now + self.table.ttl,
                },
            );
        }
        Ok(())
    }

    fn release(&self, keys: &[String], owner: u64) {
        {
            let mut held = self.table.held.lock();
            for key in keys {
                if held.get(key).map(|lock| lock.owner) == Some(owner) {
                    held.remove(key);
                }
            }
        }
        self.table.released.notify_waiters();
    }

    /// Check if the key is currently held and not expired.
    pub fn is_locked(&self, key: &str) -> bool {
        let now = Instant::now();
        self.table
            .held
            .lock()
            .get(key)
            .map(|lock| lock.expires > now)
            .unwrap_or(false)
    }
}

/// A set of held locks, released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    keys: Vec<String>,
    owner: u64,
}

impl LockGuard {
    /// The held keys, sorted.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
    /// Release the locks.
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.keys.is_empty() {
            self.manager.release(&self.keys, self.owner);
            tracing::trace!(keys=?self.keys, "Locks released");
        }
    }
}
