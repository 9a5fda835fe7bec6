//! Per-cluster mutual exclusion.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

use crate::cluster::ClusterIdentity;
use crate::error::OperationError;

/// A registry of named locks, one per managed component.
///
/// The registry is constructed once by the controller and handed to every work unit.
#[derive(Clone, Debug, Default)]
pub struct LockRegistry {
    locks: Arc<DashMap<ClusterIdentity, Arc<Mutex<()>>>>,
}

/// A held lock, released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock of the given component, waiting at most `wait`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn acquire(&self, key: &ClusterIdentity, wait: Duration) -> Result<LockGuard, OperationError> {
        let lock = self.locks.entry(key.clone()).or_default().value().clone();
        match timeout(wait, lock.lock_owned()).await {
            Ok(guard) => Ok(LockGuard { _guard: guard }),
            Err(_) => Err(OperationError::LockTimeout(key.clone(), wait)),
        }
    }

    /// Drop the lock of a component which no longer exists, if nobody holds or awaits it.
    pub fn forget(&self, key: &ClusterIdentity) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1 && lock.try_lock().is_ok());
    }
}
