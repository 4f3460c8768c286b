//! Append-only transition log.
//!
//! One event exists for every status transition; replaying a request's
//! events in order reconstructs its final status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::RequestStatus;

/// A single status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event id.
    pub id: Uuid,
    /// The request this event belongs to.
    pub request_id: Uuid,
    /// State before the transition.
    pub status_from: RequestStatus,
    /// State after the transition.
    pub status_to: RequestStatus,
    /// Authority status code, when one was involved.
    pub cstat: Option<String>,
    /// Human-readable message.
    pub message: Option<String>,
    /// Free-form structured context.
    pub metadata: serde_json::Value,
    /// When the transition happened.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Builds an event for the transition `from → to`.
    #[must_use]
    pub fn transition(request_id: Uuid, from: RequestStatus, to: RequestStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            status_from: from,
            status_to: to,
            cstat: None,
            message: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// Attaches the authority status code.
    #[must_use]
    pub fn with_cstat(mut self, cstat: impl Into<String>) -> Self {
        self.cstat = Some(cstat.into());
        self
    }

    /// Attaches a human-readable message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attaches structured metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Replays an ordered event slice and returns the resulting status.
///
/// Returns `None` for an empty slice or when the chain is inconsistent
/// (an event's `status_from` does not match the previous `status_to`).
#[must_use]
pub fn replay(events: &[Event]) -> Option<RequestStatus> {
    let mut current: Option<RequestStatus> = None;
    for event in events {
        if let Some(status) = current {
            if status != event.status_from {
                return None;
            }
        }
        current = Some(event.status_to);
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_reconstructs_final_status() {
        let id = Uuid::new_v4();
        let events = vec![
            Event::transition(id, RequestStatus::Pending, RequestStatus::Processing),
            Event::transition(id, RequestStatus::Processing, RequestStatus::Retrying),
            Event::transition(id, RequestStatus::Retrying, RequestStatus::Processing),
            Event::transition(id, RequestStatus::Processing, RequestStatus::Authorized)
                .with_cstat("100"),
        ];
        assert_eq!(replay(&events), Some(RequestStatus::Authorized));
    }

    #[test]
    fn replay_detects_broken_chain() {
        let id = Uuid::new_v4();
        let events = vec![
            Event::transition(id, RequestStatus::Pending, RequestStatus::Processing),
            Event::transition(id, RequestStatus::Retrying, RequestStatus::Processing),
        ];
        assert_eq!(replay(&events), None);
    }

    #[test]
    fn replay_of_empty_log_is_none() {
        assert_eq!(replay(&[]), None);
    }
}
