//! In-memory store for tests and local development.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{CompanyStore, RequestStore, RequestUpdate, SequenceService, StoreError};
use crate::model::{Company, Event, Request, RequestStatus};

/// Hash-map-backed implementation of all three persistence ports.
#[derive(Default)]
pub struct MemoryStore {
    requests: Mutex<HashMap<Uuid, Request>>,
    by_key: Mutex<HashMap<String, Uuid>>,
    events: Mutex<Vec<Event>>,
    companies: Mutex<HashMap<Uuid, Company>>,
    sequences: Mutex<HashMap<(Uuid, u16), i64>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a company for subsequent pipeline runs.
    pub fn put_company(&self, company: Company) {
        self.companies.lock().unwrap().insert(company.id, company);
    }

    /// Test hook: the current status of a request.
    #[must_use]
    pub fn status_of(&self, id: Uuid) -> Option<RequestStatus> {
        self.requests.lock().unwrap().get(&id).map(|r| r.status)
    }
}

fn apply_update(request: &mut Request, update: RequestUpdate) {
    if let Some(value) = update.access_key {
        request.access_key = Some(value);
    }
    if let Some(value) = update.protocol {
        request.protocol = Some(value);
    }
    if let Some(value) = update.document_number {
        request.document_number = Some(value);
    }
    if let Some(value) = update.series {
        request.series = Some(value);
    }
    if let Some(value) = update.rejection_code {
        request.rejection_code = Some(value);
    }
    if let Some(value) = update.rejection_reason {
        request.rejection_reason = Some(value);
    }
    if let Some(value) = update.retry_count {
        request.retry_count = value;
    }
    if let Some(value) = update.next_retry_at {
        request.next_retry_at = value;
    }
    if let Some(value) = update.processed_at {
        request.processed_at = Some(value);
    }
    if let Some(value) = update.authorized_at {
        request.authorized_at = Some(value);
    }
    if let Some(value) = update.in_contingency {
        request.in_contingency = value;
    }
    if let Some(value) = update.contingency_kind {
        request.contingency_kind = Some(value);
    }
    if let Some(value) = update.xml_url {
        request.xml_url = Some(value);
    }
    if let Some(value) = update.pdf_url {
        request.pdf_url = Some(value);
    }
    if let Some(value) = update.qr_url {
        request.qr_url = Some(value);
    }
    request.updated_at = Utc::now();
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert(&self, request: &Request) -> Result<(), StoreError> {
        let mut by_key = self.by_key.lock().unwrap();
        if by_key.contains_key(&request.idempotency_key) {
            return Err(StoreError::DuplicateIdempotencyKey);
        }
        by_key.insert(request.idempotency_key.clone(), request.id);
        self.requests
            .lock()
            .unwrap()
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Request>, StoreError> {
        Ok(self.requests.lock().unwrap().get(&id).cloned())
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Request>, StoreError> {
        let id = self.by_key.lock().unwrap().get(key).copied();
        Ok(id.and_then(|id| self.requests.lock().unwrap().get(&id).cloned()))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
        update: RequestUpdate,
    ) -> Result<bool, StoreError> {
        let mut requests = self.requests.lock().unwrap();
        let Some(request) = requests.get_mut(&id) else {
            return Ok(false);
        };
        if request.status != from {
            return Ok(false);
        }
        request.status = to;
        apply_update(request, update);
        Ok(true)
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn events(&self, request_id: Uuid) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Request>, StoreError> {
        let requests = self.requests.lock().unwrap();
        let mut due: Vec<Request> = requests
            .values()
            .filter(|request| {
                request.status == RequestStatus::Retrying
                    && request.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|request| request.next_retry_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Request>, StoreError> {
        let requests = self.requests.lock().unwrap();
        let mut stale: Vec<Request> = requests
            .values()
            .filter(|request| {
                request.status == RequestStatus::Pending && request.created_at <= older_than
            })
            .cloned()
            .collect();
        stale.sort_by_key(|request| request.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}

#[async_trait]
impl CompanyStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Company>, StoreError> {
        Ok(self.companies.lock().unwrap().get(&id).cloned())
    }
}

#[async_trait]
impl SequenceService for MemoryStore {
    async fn next_number(&self, company_id: Uuid, series: u16) -> Result<i64, StoreError> {
        let mut sequences = self.sequences.lock().unwrap();
        let counter = sequences.entry((company_id, series)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::sample_payload;

    #[tokio::test]
    async fn insert_is_unique_per_key() {
        let store = MemoryStore::new();
        let request = Request::new("key-1".to_string(), sample_payload());
        store.insert(&request).await.unwrap();

        let duplicate = Request::new("key-1".to_string(), sample_payload());
        assert!(matches!(
            store.insert(&duplicate).await,
            Err(StoreError::DuplicateIdempotencyKey)
        ));
    }

    #[tokio::test]
    async fn transition_is_guarded_by_from_status() {
        let store = MemoryStore::new();
        let request = Request::new("key-2".to_string(), sample_payload());
        store.insert(&request).await.unwrap();

        let won = store
            .transition(
                request.id,
                RequestStatus::Pending,
                RequestStatus::Processing,
                RequestUpdate::default(),
            )
            .await
            .unwrap();
        assert!(won);

        // Second claim from the stale status loses.
        let lost = store
            .transition(
                request.id,
                RequestStatus::Pending,
                RequestStatus::Processing,
                RequestUpdate::default(),
            )
            .await
            .unwrap();
        assert!(!lost);
    }

    #[tokio::test]
    async fn sequence_is_monotonic_under_concurrency() {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.next_number(company, 1).await.unwrap()
            }));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=16).collect::<Vec<i64>>());
    }
}
