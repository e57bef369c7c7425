//! Reconciliation locking primitives.
//!
//! Reconcilers serialize work on one declared resource through a [`LockManager`].
//! Keys are the resource's stable identity (instance uuid, volume name, image
//! reference), never a runtime-assigned id which may not exist yet.
//!
//! # Invariants
//!
//! - At most one [`LockGuard`] exists per key at any time
//! - A guard releases its key on drop, including on error and cancellation
//! - Waiters are admitted in FIFO order
//! - Keys that are neither held nor awaited do not accumulate

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock acquisition errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock table is unusable.
    #[error("lock storage unavailable for {key}")]
    Poisoned { key: String },

    /// The lock was not granted in time.
    #[error("timed out after {waited:?} waiting for lock on {key}")]
    Timeout { key: String, waited: Duration },
}

/// Per-key mutual exclusion for reconciliations.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
    timeout: Option<Duration>,
}

impl LockManager {
    /// Lock manager that waits forever.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock manager that gives up after `timeout`. `None` waits forever.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Acquire the lock for `key`, waiting for any current holder.
    pub async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        let lock = self.entry(key)?;
        let started = Instant::now();

        let guard = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map_err(|_| LockError::Timeout {
                    key: key.to_string(),
                    waited: started.elapsed(),
                })?,
            None => lock.lock_owned().await,
        };

        Ok(LockGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.values().filter(|l| l.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Whether a guard on `key` currently exists.
    pub fn is_held(&self, key: &str) -> bool {
        let lock = match self.locks.lock() {
            Ok(locks) => locks.get(key).and_then(Weak::upgrade),
            Err(_) => return false,
        };
        let Some(lock) = lock else {
            return false;
        };
        let held = lock.try_lock().is_err();
        held
    }

    fn entry(&self, key: &str) -> Result<Arc<AsyncMutex<()>>, LockError> {
        let mut locks = self.locks.lock().map_err(|_| LockError::Poisoned {
            key: key.to_string(),
        })?;

        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return Ok(lock);
        }

        locks.retain(|_, lock| lock.strong_count() > 0);

        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        Ok(lock)
    }
}

/// Held lock on one key. Dropping it releases the key.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}
