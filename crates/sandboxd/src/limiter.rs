use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ServiceError, ServiceResult};

/// System-wide cap on simultaneous executions.
///
/// `max_concurrent` executions hold a slot; up to `max_queued` more may wait
/// for one. Anything beyond that is refused immediately with
/// [`ServiceError::Overloaded`].
pub struct ExecutionLimiter {
    slots: Arc<Semaphore>,
    admitted: Arc<AtomicUsize>,
    max_concurrent: usize,
    capacity: usize,
}

impl ExecutionLimiter {
    pub fn new(max_concurrent: usize, max_queued: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            admitted: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
            capacity: max_concurrent.saturating_add(max_queued),
        }
    }

    /// Take a place in line without waiting. The returned admission must be
    /// kept alive for the whole execution.
    pub fn admit(&self) -> ServiceResult<Admission> {
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map_err(|_| ServiceError::Overloaded)?;
        Ok(Admission {
            slots: self.slots.clone(),
            admitted: self.admitted.clone(),
        })
    }

    /// Executions holding a slot.
    pub fn running(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.slots.available_permits())
    }

    /// Admitted executions still waiting for a slot.
    pub fn queued(&self) -> usize {
        self.admitted
            .load(Ordering::Acquire)
            .saturating_sub(self.running())
    }
}

/// A place in the execution queue; released on drop.
pub struct Admission {
    slots: Arc<Semaphore>,
    admitted: Arc<AtomicUsize>,
}

impl Admission {
    /// Wait for an execution slot.
    pub async fn slot(&self) -> ServiceResult<OwnedSemaphorePermit> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::Internal("execution limiter closed".into()))
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.admitted.fetch_sub(1, Ordering::AcqRel);
    }
}
