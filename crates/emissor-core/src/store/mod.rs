//! Persistence ports and adapters.
//!
//! Three narrow traits: the request store (with compare-and-set status
//! transitions), the company configuration provider, and the per-company
//! monotonic sequence service. Production lives in [`postgres`]; an
//! in-memory variant backs tests and local development.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Company, ContingencyKind, Event, Request, RequestStatus};

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An insert collided with the unique idempotency key.
    #[error("idempotency key already exists")]
    DuplicateIdempotencyKey,

    /// A stored row could not be decoded into the domain model.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Field updates applied atomically together with a status transition.
///
/// `None` leaves a column untouched; the double-`Option` fields distinguish
/// "leave" from "clear".
#[derive(Debug, Default, Clone)]
pub struct RequestUpdate {
    /// Sets the access key.
    pub access_key: Option<String>,
    /// Sets the authority protocol.
    pub protocol: Option<String>,
    /// Sets the issued document number.
    pub document_number: Option<i64>,
    /// Sets the issued series.
    pub series: Option<u16>,
    /// Sets the rejection code.
    pub rejection_code: Option<String>,
    /// Sets the rejection reason.
    pub rejection_reason: Option<String>,
    /// Sets the retry counter.
    pub retry_count: Option<u32>,
    /// Sets or clears the next retry deadline.
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    /// Sets the processing completion time.
    pub processed_at: Option<DateTime<Utc>>,
    /// Sets the authorization time.
    pub authorized_at: Option<DateTime<Utc>>,
    /// Sets the contingency marker.
    pub in_contingency: Option<bool>,
    /// Sets the contingency family.
    pub contingency_kind: Option<ContingencyKind>,
    /// Sets the archived XML URL.
    pub xml_url: Option<String>,
    /// Sets the archived PDF URL.
    pub pdf_url: Option<String>,
    /// Sets the archived QR image URL.
    pub qr_url: Option<String>,
}

/// The request aggregate store.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Inserts a fresh request.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateIdempotencyKey`] when the key is taken.
    async fn insert(&self, request: &Request) -> Result<(), StoreError>;

    /// Loads a request by id.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on store failure; absence is `Ok(None)`.
    async fn get(&self, id: Uuid) -> Result<Option<Request>, StoreError>;

    /// Loads a request by idempotency key.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on store failure; absence is `Ok(None)`.
    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Request>, StoreError>;

    /// Compare-and-set transition: applies `update` and moves the status to
    /// `to` only when the current status still equals `from`. Returns
    /// whether this caller won the transition.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on store failure; losing the race is `Ok(false)`.
    async fn transition(
        &self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
        update: RequestUpdate,
    ) -> Result<bool, StoreError>;

    /// Appends a transition event.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on store failure.
    async fn append_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Returns a request's events in insertion order.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on store failure.
    async fn events(&self, request_id: Uuid) -> Result<Vec<Event>, StoreError>;

    /// Requests in `retrying` whose deadline has passed, oldest deadline
    /// first, bounded by `limit`.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on store failure.
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Request>, StoreError>;

    /// `pending` requests created before `older_than` - orphans whose
    /// enqueue never happened or was lost.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on store failure.
    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Request>, StoreError>;
}

/// Narrow read surface over company configuration.
#[async_trait]
pub trait CompanyStore: Send + Sync {
    /// Loads a company by id.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on store failure; absence is `Ok(None)`.
    async fn get(&self, id: Uuid) -> Result<Option<Company>, StoreError>;
}

/// Atomic per-company document numbering.
#[async_trait]
pub trait SequenceService: Send + Sync {
    /// Returns a number strictly greater than every number previously
    /// returned for `(company, series)`.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on store failure.
    async fn next_number(&self, company_id: Uuid, series: u16) -> Result<i64, StoreError>;
}
