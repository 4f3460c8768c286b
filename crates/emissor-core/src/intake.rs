//! Intake: idempotent ingestion and durable enqueue.
//!
//! Exactly one `Request` row exists per idempotency key. Losing the insert
//! race is handled by re-reading the winner; a failed publish leaves the
//! record `pending` for the retry scheduler to revive.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EmissionError;
use crate::model::{Event, Request, RequestStatus, SalePayload};
use crate::queue::{CancelJob, EmitJob, JobPublisher};
use crate::store::{RequestStore, RequestUpdate};

/// Longest accepted `Idempotency-Key` header value.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// What a submission produced.
#[derive(Debug)]
pub enum IntakeOutcome {
    /// First submission: a fresh `pending` request was created.
    Accepted(Request),
    /// Replay: the caller's earlier request, in its current state.
    Existing(Request),
    /// Replay of a rejected request; the caller must mint a new key.
    AlreadyRejected(Request),
}

/// The intake service shared by all HTTP handlers.
pub struct IntakeService {
    requests: Arc<dyn RequestStore>,
    publisher: Arc<dyn JobPublisher>,
}

impl IntakeService {
    /// Wires the service.
    #[must_use]
    pub fn new(requests: Arc<dyn RequestStore>, publisher: Arc<dyn JobPublisher>) -> Self {
        Self {
            requests,
            publisher,
        }
    }

    /// Submits a sale for emission.
    ///
    /// # Errors
    ///
    /// [`EmissionError::Validation`] for bad keys or payloads,
    /// [`EmissionError::IdempotencyConflict`] when the key was already used
    /// with different data, [`EmissionError::Infra`] when the store fails.
    pub async fn submit(
        &self,
        idempotency_key: &str,
        payload: SalePayload,
    ) -> Result<IntakeOutcome, EmissionError> {
        if idempotency_key.trim().is_empty() {
            return Err(EmissionError::Validation(
                "Idempotency-Key header is required".to_string(),
            ));
        }
        if idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(EmissionError::Validation(format!(
                "Idempotency-Key exceeds {MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }

        if let Some(existing) = self
            .requests
            .get_by_idempotency_key(idempotency_key)
            .await
            .map_err(|err| EmissionError::Infra(err.to_string()))?
        {
            return Self::replay(existing, &payload);
        }

        payload.validate()?;

        let request = Request::new(idempotency_key.to_string(), payload);
        match self.requests.insert(&request).await {
            Ok(()) => {},
            Err(crate::store::StoreError::DuplicateIdempotencyKey) => {
                // Concurrent identical submission: observe the winner.
                let existing = self
                    .requests
                    .get_by_idempotency_key(idempotency_key)
                    .await
                    .map_err(|err| EmissionError::Infra(err.to_string()))?
                    .ok_or_else(|| {
                        EmissionError::Infra("winner of insert race disappeared".to_string())
                    })?;
                return Self::replay(existing, &request.payload);
            },
            Err(err) => return Err(EmissionError::Infra(err.to_string())),
        }

        let job = EmitJob {
            request_id: request.id,
            idempotency_key: request.idempotency_key.clone(),
            retry_count: 0,
            enqueued_at: Utc::now(),
        };
        if let Err(err) = self.publisher.publish_emit(&job).await {
            // Recoverable: the scheduler republishes stale pending records.
            warn!(request_id = %request.id, error = %err,
                "enqueue failed, leaving request pending for revival");
        }

        info!(request_id = %request.id, "emission request accepted");
        Ok(IntakeOutcome::Accepted(request))
    }

    fn replay(existing: Request, payload: &SalePayload) -> Result<IntakeOutcome, EmissionError> {
        if existing.payload_hash != payload.content_hash() {
            return Err(EmissionError::IdempotencyConflict);
        }
        if existing.status == RequestStatus::Rejected {
            return Ok(IntakeOutcome::AlreadyRejected(existing));
        }
        Ok(IntakeOutcome::Existing(existing))
    }

    /// Enqueues cancellation of an authorized document.
    ///
    /// Returns `Ok(None)` for an unknown id.
    ///
    /// # Errors
    ///
    /// [`EmissionError::Validation`] when the request is not authorized or
    /// the justification is too short, [`EmissionError::Infra`] on store or
    /// broker failure.
    pub async fn cancel(
        &self,
        id: Uuid,
        justification: &str,
    ) -> Result<Option<Request>, EmissionError> {
        if justification.trim().len() < 15 {
            return Err(EmissionError::Validation(
                "cancellation justification must have at least 15 characters".to_string(),
            ));
        }

        let Some(request) = self
            .requests
            .get(id)
            .await
            .map_err(|err| EmissionError::Infra(err.to_string()))?
        else {
            return Ok(None);
        };

        if request.status != RequestStatus::Authorized {
            return Err(EmissionError::Validation(
                "only authorized documents can be canceled".to_string(),
            ));
        }

        let won = self
            .requests
            .transition(
                id,
                RequestStatus::Authorized,
                RequestStatus::Canceled,
                RequestUpdate::default(),
            )
            .await
            .map_err(|err| EmissionError::Infra(err.to_string()))?;
        if !won {
            return Err(EmissionError::Validation(
                "request changed state during cancellation".to_string(),
            ));
        }
        if let Err(err) = self
            .requests
            .append_event(
                &Event::transition(id, RequestStatus::Authorized, RequestStatus::Canceled)
                    .with_message(justification.to_string()),
            )
            .await
        {
            warn!(request_id = %id, error = %err, "cancellation event append failed");
        }

        let job = CancelJob {
            request_id: id,
            justification: justification.to_string(),
            enqueued_at: Utc::now(),
        };
        if let Err(err) = self.publisher.publish_cancel(&job).await {
            // Roll the status back so the caller can try again.
            warn!(request_id = %id, error = %err, "cancel publish failed, rolling back");
            let _ = self
                .requests
                .transition(
                    id,
                    RequestStatus::Canceled,
                    RequestStatus::Authorized,
                    RequestUpdate::default(),
                )
                .await;
            return Err(EmissionError::Infra(err.to_string()));
        }

        self.requests
            .get(id)
            .await
            .map_err(|err| EmissionError::Infra(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample_payload;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;

    fn service() -> (IntakeService, Arc<MemoryStore>, Arc<MemoryQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let service = IntakeService::new(store.clone(), queue.clone());
        (service, store, queue)
    }

    #[tokio::test]
    async fn first_submission_is_accepted_and_enqueued() {
        let (service, _store, queue) = service();
        let outcome = service.submit("key-1", sample_payload()).await.unwrap();

        let IntakeOutcome::Accepted(request) = outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(request.status, RequestStatus::Pending);

        let jobs = queue.emitted();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].request_id, request.id);
    }

    #[tokio::test]
    async fn replay_returns_existing_request() {
        let (service, _store, queue) = service();
        let payload = sample_payload();
        let first = service.submit("key-2", payload.clone()).await.unwrap();
        let IntakeOutcome::Accepted(created) = first else {
            panic!("expected acceptance");
        };

        let second = service.submit("key-2", payload).await.unwrap();
        let IntakeOutcome::Existing(existing) = second else {
            panic!("expected replay");
        };
        assert_eq!(existing.id, created.id);
        // No second job.
        assert_eq!(queue.emitted().len(), 1);
    }

    #[tokio::test]
    async fn replay_with_different_payload_conflicts() {
        let (service, _store, _queue) = service();
        service.submit("key-3", sample_payload()).await.unwrap();

        let mut other = sample_payload();
        other.items[0].unit_price = rust_decimal_macros::dec!(10.00);
        other.payments[0].amount = rust_decimal_macros::dec!(10.00);
        assert!(matches!(
            service.submit("key-3", other).await,
            Err(EmissionError::IdempotencyConflict)
        ));
    }

    #[tokio::test]
    async fn rejected_replay_requires_new_key() {
        let (service, store, _queue) = service();
        let outcome = service.submit("key-4", sample_payload()).await.unwrap();
        let IntakeOutcome::Accepted(request) = outcome else {
            panic!("expected acceptance");
        };

        store
            .transition(
                request.id,
                RequestStatus::Pending,
                RequestStatus::Processing,
                RequestUpdate::default(),
            )
            .await
            .unwrap();
        store
            .transition(
                request.id,
                RequestStatus::Processing,
                RequestStatus::Rejected,
                RequestUpdate::default(),
            )
            .await
            .unwrap();

        assert!(matches!(
            service.submit("key-4", sample_payload()).await.unwrap(),
            IntakeOutcome::AlreadyRejected(_)
        ));
    }

    #[tokio::test]
    async fn publish_failure_leaves_request_pending() {
        let (service, store, queue) = service();
        queue.fail_publishes(true);

        let outcome = service.submit("key-5", sample_payload()).await.unwrap();
        let IntakeOutcome::Accepted(request) = outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(store.status_of(request.id), Some(RequestStatus::Pending));
        assert!(queue.emitted().is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_is_refused() {
        let (service, _store, _queue) = service();
        let mut payload = sample_payload();
        payload.items.clear();
        assert!(matches!(
            service.submit("key-6", payload).await,
            Err(EmissionError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn cancel_requires_authorized_status() {
        let (service, _store, _queue) = service();
        let outcome = service.submit("key-7", sample_payload()).await.unwrap();
        let IntakeOutcome::Accepted(request) = outcome else {
            panic!("expected acceptance");
        };

        let result = service
            .cancel(request.id, "desistencia da venda pelo consumidor")
            .await;
        assert!(matches!(result, Err(EmissionError::Validation(_))));
    }

    #[tokio::test]
    async fn cancel_publishes_and_transitions() {
        let (service, store, queue) = service();
        let outcome = service.submit("key-8", sample_payload()).await.unwrap();
        let IntakeOutcome::Accepted(request) = outcome else {
            panic!("expected acceptance");
        };

        store
            .transition(
                request.id,
                RequestStatus::Pending,
                RequestStatus::Processing,
                RequestUpdate::default(),
            )
            .await
            .unwrap();
        store
            .transition(
                request.id,
                RequestStatus::Processing,
                RequestStatus::Authorized,
                RequestUpdate::default(),
            )
            .await
            .unwrap();

        let canceled = service
            .cancel(request.id, "desistencia da venda pelo consumidor")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(canceled.status, RequestStatus::Canceled);
        assert_eq!(queue.canceled().len(), 1);
    }
}
