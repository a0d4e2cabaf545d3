//! Per-stack coordination locks.
//!
//! One async mutex per stack id. Applies on different stacks never share a
//! lock; applies on the same stack queue with a bounded wait.

use crate::error::{DevarchError, Result};
use crate::observability::metrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

/// Registry of stack locks, shared by clones of the owning repository.
#[derive(Debug, Clone, Default)]
pub struct StackLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl StackLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `stack_id`, waiting at most `timeout`.
    #[instrument(skip(self), fields(stack_id = %stack_id))]
    pub async fn acquire(&self, stack_id: &str, timeout: Duration) -> Result<StackLockGuard> {
        let lock = self.entry(stack_id).await;
        let started = Instant::now();

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                let waited = started.elapsed();
                metrics::record_lock_wait(waited);
                debug!(waited_ms = waited.as_millis() as u64, "Stack lock acquired");
                Ok(StackLockGuard { stack_id: stack_id.to_string(), acquired_at: Instant::now(), _guard: guard })
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for stack lock");
                Err(DevarchError::LockTimeout { stack_id: stack_id.to_string(), waited: timeout })
            }
        }
    }

    /// Whether an apply currently holds the lock for `stack_id`.
    pub async fn is_locked(&self, stack_id: &str) -> bool {
        let locks = self.locks.lock().await;
        locks.get(stack_id).is_some_and(|lock| lock.try_lock().is_err())
    }

    async fn entry(&self, stack_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // Drop entries nobody holds or waits on.
        locks.retain(|id, lock| id == stack_id || Arc::strong_count(lock) > 1);
        locks.entry(stack_id.to_string()).or_default().clone()
    }
}

/// Exclusive right to mutate one stack. Released on drop.
#[derive(Debug)]
pub struct StackLockGuard {
    stack_id: String,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl StackLockGuard {
    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}
