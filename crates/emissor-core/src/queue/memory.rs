//! In-memory queue for tests and local development.

#![allow(clippy::missing_panics_doc)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CancelJob, EmitJob, JobPublisher, QueueError};

/// Vec-backed publisher that records everything it is handed.
#[derive(Default)]
pub struct MemoryQueue {
    emitted: Mutex<Vec<EmitJob>>,
    canceled: Mutex<Vec<CancelJob>>,
    fail_publishes: AtomicBool,
}

impl MemoryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent publishes fail, simulating a broker outage.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Jobs published so far.
    #[must_use]
    pub fn emitted(&self) -> Vec<EmitJob> {
        self.emitted.lock().unwrap().clone()
    }

    /// Cancellations published so far.
    #[must_use]
    pub fn canceled(&self) -> Vec<CancelJob> {
        self.canceled.lock().unwrap().clone()
    }

    /// Removes and returns the oldest emission job, as a consumer would.
    #[must_use]
    pub fn pop_emit(&self) -> Option<EmitJob> {
        let mut emitted = self.emitted.lock().unwrap();
        if emitted.is_empty() {
            None
        } else {
            Some(emitted.remove(0))
        }
    }
}

#[async_trait]
impl JobPublisher for MemoryQueue {
    async fn publish_emit(&self, job: &EmitJob) -> Result<(), QueueError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("broker down".to_string()));
        }
        self.emitted.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn publish_cancel(&self, job: &CancelJob) -> Result<(), QueueError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("broker down".to_string()));
        }
        self.canceled.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn healthy(&self) -> bool {
        !self.fail_publishes.load(Ordering::SeqCst)
    }
}
