//! Broker port: durable job messages referencing requests by id.
//!
//! Messages carry only the request reference; the worker re-reads the
//! authoritative payload from the store on every delivery, so retries never
//! act on stale data.

mod memory;
mod rabbit;

pub use memory::MemoryQueue;
pub use rabbit::RabbitQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Routing key of the emission queue.
pub const EMIT_ROUTING_KEY: &str = "nfce.emit";
/// Routing key of the cancellation queue.
pub const CANCEL_ROUTING_KEY: &str = "nfce.cancel";

/// Broker failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker could not be reached or refused the operation.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The message could not be serialized.
    #[error("job serialization failed: {0}")]
    Serialize(String),
}

/// One emission job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitJob {
    /// The request to drive through the pipeline.
    pub request_id: Uuid,
    /// The caller key, carried for log correlation only.
    pub idempotency_key: String,
    /// Attempts consumed when the job was (re-)published.
    pub retry_count: u32,
    /// Publication time.
    pub enqueued_at: DateTime<Utc>,
}

/// One cancellation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelJob {
    /// The authorized request being canceled.
    pub request_id: Uuid,
    /// Caller-supplied justification.
    pub justification: String,
    /// Publication time.
    pub enqueued_at: DateTime<Utc>,
}

/// Publisher half of the broker port.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Publishes an emission job.
    ///
    /// # Errors
    ///
    /// [`QueueError`] when the broker rejects the publish.
    async fn publish_emit(&self, job: &EmitJob) -> Result<(), QueueError>;

    /// Publishes a cancellation job.
    ///
    /// # Errors
    ///
    /// [`QueueError`] when the broker rejects the publish.
    async fn publish_cancel(&self, job: &CancelJob) -> Result<(), QueueError>;

    /// Whether the broker connection is currently usable. Drives the
    /// liveness probe.
    async fn healthy(&self) -> bool;
}

/// What the consumer loop should do with a raw delivery.
#[derive(Debug)]
pub enum DeliveryVerdict {
    /// A well-formed job: process, then acknowledge.
    Process(EmitJob),
    /// Malformed JSON or missing reference: negative-acknowledge without
    /// requeue.
    Poison(String),
}

/// Classifies a raw delivery body.
#[must_use]
pub fn classify_delivery(body: &[u8]) -> DeliveryVerdict {
    match serde_json::from_slice::<EmitJob>(body) {
        Ok(job) if !job.request_id.is_nil() => DeliveryVerdict::Process(job),
        Ok(_) => DeliveryVerdict::Poison("missing request_id".to_string()),
        Err(err) => DeliveryVerdict::Poison(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_job_is_processed() {
        let job = EmitJob {
            request_id: Uuid::new_v4(),
            idempotency_key: "key".to_string(),
            retry_count: 0,
            enqueued_at: Utc::now(),
        };
        let body = serde_json::to_vec(&job).unwrap();
        assert!(matches!(
            classify_delivery(&body),
            DeliveryVerdict::Process(parsed) if parsed.request_id == job.request_id
        ));
    }

    #[test]
    fn malformed_json_is_poison() {
        assert!(matches!(
            classify_delivery(b"{not json"),
            DeliveryVerdict::Poison(_)
        ));
    }

    #[test]
    fn nil_request_id_is_poison() {
        let body = format!(
            "{{\"request_id\":\"{}\",\"idempotency_key\":\"k\",\"retry_count\":0,\
             \"enqueued_at\":\"2026-08-02T10:30:00Z\"}}",
            Uuid::nil()
        );
        assert!(matches!(
            classify_delivery(body.as_bytes()),
            DeliveryVerdict::Poison(_)
        ));
    }
}
