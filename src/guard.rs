//! Concurrency guard for redis-less operation.
//!
//! Without the distributed queue there is no backpressure between
//! replicas, so inline jobs are bounded by a fixed number of slots. A
//! slot is taken after the rate check and before the job task is
//! spawned; the returned permit releases itself when dropped, so every
//! exit path — panics included — gives the slot back.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

#[derive(Debug, Clone)]
pub struct JobSlots {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl JobSlots {
    pub fn new(max: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max)), max }
    }

    /// Try to take a slot. The permit must be held for the duration of
    /// the job; dropping it releases the slot.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn active(&self) -> usize {
        self.max.saturating_sub(self.semaphore.available_permits())
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

impl Default for JobSlots {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}
