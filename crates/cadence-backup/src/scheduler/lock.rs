//! Single-slot run lock
//!
//! Backup and check runs share one repository and must never overlap. The
//! lock never waits: a firing that finds it held is skipped.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Exclusivity token shared by every scheduled action of one process
#[derive(Clone, Debug)]
pub struct RunLock {
    slot: Arc<Semaphore>,
}

/// Held while a run executes; released on drop
#[derive(Debug)]
pub struct RunGuard {
    _permit: OwnedSemaphorePermit,
}

impl RunLock {
    /// Create an available lock
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the lock if it is free
    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.slot
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| RunGuard { _permit: permit })
    }

    /// Whether a run currently holds the lock
    pub fn is_held(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

impl Default for RunLock {
    fn default() -> Self {
        Self::new()
    }
}
