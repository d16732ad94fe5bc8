//! Counting semaphore bounding simultaneous task execution.
//!
//! Wraps `tokio::sync::Semaphore` so that permits are only ever returned by
//! dropping a [`TaskPermit`]. Release therefore happens on every exit path of
//! the holder, including errors and panics inside a spawned task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Error returned when acquiring from a closed semaphore.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("semaphore closed")]
pub struct SemaphoreClosed;

#[derive(Debug)]
struct Usage {
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

/// A counting semaphore with a fixed capacity.
#[derive(Debug, Clone)]
pub struct TaskSemaphore {
    inner: Arc<Semaphore>,
    capacity: usize,
    usage: Arc<Usage>,
}

impl TaskSemaphore {
    /// Create a semaphore with `capacity` permits. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Semaphore::new(capacity)),
            capacity,
            usage: Arc::new(Usage {
                in_use: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a permit. Permits are granted in FIFO order.
    pub async fn acquire(&self) -> Result<TaskPermit, SemaphoreClosed> {
        let permit = Arc::clone(&self.inner)
            .acquire_owned()
            .await
            .map_err(|_| SemaphoreClosed)?;
        Ok(self.track(permit))
    }

    /// Take a permit without waiting, if one is free.
    pub fn try_acquire(&self) -> Option<TaskPermit> {
        Arc::clone(&self.inner)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.track(permit))
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    /// Total permits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.usage.in_use.load(Ordering::SeqCst)
    }

    /// Highest number of permits held at once since creation.
    pub fn peak(&self) -> usize {
        self.usage.peak.load(Ordering::SeqCst)
    }

    /// True when every permit has been returned.
    pub fn is_idle(&self) -> bool {
        self.available() == self.capacity
    }

    /// Close the semaphore. Pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.inner.close();
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> TaskPermit {
        let now = self.usage.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.usage.peak.fetch_max(now, Ordering::SeqCst);
        TaskPermit {
            _permit: permit,
            usage: Arc::clone(&self.usage),
        }
    }
}

/// A held permit. Dropping it releases the slot.
#[derive(Debug)]
pub struct TaskPermit {
    _permit: OwnedSemaphorePermit,
    usage: Arc<Usage>,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.usage.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}
