//! The `Request` aggregate and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payload::SalePayload;

/// Lifecycle state of an emission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Persisted by intake, not yet picked up.
    Pending,
    /// A worker is driving the pipeline.
    Processing,
    /// Terminal: the authority authorized the document.
    Authorized,
    /// Terminal: business rejection, fatal error, or exhausted budget.
    Rejected,
    /// The pipeline switched to a contingency authority.
    Contingency,
    /// Waiting for the next scheduled attempt.
    Retrying,
    /// Terminal: canceled after authorization.
    Canceled,
}

impl RequestStatus {
    /// Database/string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Authorized => "authorized",
            Self::Rejected => "rejected",
            Self::Contingency => "contingency",
            Self::Retrying => "retrying",
            Self::Canceled => "canceled",
        }
    }

    /// Parses the database representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "authorized" => Some(Self::Authorized),
            "rejected" => Some(Self::Rejected),
            "contingency" => Some(Self::Contingency),
            "retrying" => Some(Self::Retrying),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Whether `self → to` is an allowed transition.
    ///
    /// The table mirrors the pipeline: `pending → processing`, processing
    /// fans out to the terminal and transient states, `retrying` and
    /// `contingency` feed back into `processing`, and only `authorized` may
    /// become `canceled`. Terminal rejection always happens from
    /// `processing`; a `retrying` record is claimed back into `processing`
    /// before any further outcome.
    #[must_use]
    pub fn allows(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Authorized)
                | (Self::Processing, Self::Rejected)
                | (Self::Processing, Self::Retrying)
                | (Self::Processing, Self::Contingency)
                | (Self::Retrying, Self::Processing)
                | (Self::Contingency, Self::Processing)
                | (Self::Authorized, Self::Canceled)
        )
    }

    /// Whether the state admits no further transitions except cancellation.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Canceled | Self::Authorized)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contingency authority family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContingencyKind {
    /// National virtual contingency service.
    #[serde(rename = "SVC-AN")]
    SvcAn,
    /// Southern-region virtual contingency service.
    #[serde(rename = "SVC-RS")]
    SvcRs,
}

impl ContingencyKind {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SvcAn => "SVC-AN",
            Self::SvcRs => "SVC-RS",
        }
    }

    /// Value of the XML `tpEmis` field under this contingency.
    #[must_use]
    pub const fn tp_emis(self) -> &'static str {
        match self {
            Self::SvcAn => "6",
            Self::SvcRs => "7",
        }
    }

    /// Parses the wire representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SVC-AN" => Some(Self::SvcAn),
            "SVC-RS" => Some(Self::SvcRs),
            _ => None,
        }
    }
}

/// The central aggregate: one emission request and everything learned about
/// it so far. Created by intake, mutated only by the worker, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// System-assigned id.
    pub id: Uuid,
    /// Issuing company.
    pub company_id: Uuid,
    /// Caller-supplied key, unique across all requests.
    pub idempotency_key: String,
    /// SHA-256 hex of the serialized payload, for replay conflict checks.
    pub payload_hash: String,
    /// Current lifecycle state.
    pub status: RequestStatus,
    /// Immutable sale payload.
    pub payload: SalePayload,

    /// 44-character access key, set on authorization.
    pub access_key: Option<String>,
    /// Authority protocol number, set on authorization.
    pub protocol: Option<String>,
    /// Issued document number.
    pub document_number: Option<i64>,
    /// Issued series.
    pub series: Option<u16>,

    /// Authority status code on rejection.
    pub rejection_code: Option<String>,
    /// Authority reason on rejection.
    pub rejection_reason: Option<String>,

    /// Attempts consumed so far.
    pub retry_count: u32,
    /// When the next attempt is due, while `retrying`.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the worker last finished handling the request.
    pub processed_at: Option<DateTime<Utc>>,
    /// When the authority authorized the document.
    pub authorized_at: Option<DateTime<Utc>>,

    /// Whether the document was emitted under contingency.
    pub in_contingency: bool,
    /// Which contingency family was used.
    pub contingency_kind: Option<ContingencyKind>,

    /// Archived signed XML location.
    pub xml_url: Option<String>,
    /// Archived DANFE PDF location.
    pub pdf_url: Option<String>,
    /// Archived QR image location.
    pub qr_url: Option<String>,

    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Request {
    /// Builds a fresh `pending` request at intake.
    #[must_use]
    pub fn new(idempotency_key: String, payload: SalePayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            company_id: payload.company_id,
            idempotency_key,
            payload_hash: payload.content_hash(),
            status: RequestStatus::Pending,
            payload,
            access_key: None,
            protocol: None,
            document_number: None,
            series: None,
            rejection_code: None,
            rejection_reason: None,
            retry_count: 0,
            next_retry_at: None,
            processed_at: None,
            authorized_at: None,
            in_contingency: false,
            contingency_kind: None,
            xml_url: None,
            pdf_url: None,
            qr_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Age of the request relative to `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}
