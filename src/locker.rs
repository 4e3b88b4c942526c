//! Named async locks keyed by (resource, operation)
//!
//! At most one holder per key at a time; everyone else waits in line.
//! Releasing is dropping the guard.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RunnerError};

type LockKey = (String, String);

#[derive(Default)]
pub struct AsyncLocker {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

/// Held lock; dropping it lets the next waiter in
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl AsyncLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock on `(resource, operation)`.
    /// Fails with `Cancelled` if `cancel` fires first.
    pub async fn acquire(&self, resource: &str, operation: &str, cancel: &CancellationToken) -> Result<LockGuard> {
        let lock = self
            .locks
            .entry((resource.to_string(), operation.to_string()))
            .or_default()
            .clone();

        tokio::select! {
            guard = lock.lock_owned() => Ok(LockGuard { _guard: guard }),
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
        }
    }

    /// Whether someone currently holds the lock
    pub fn is_locked(&self, resource: &str, operation: &str) -> bool {
        self.locks
            .get(&(resource.to_string(), operation.to_string()))
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}
