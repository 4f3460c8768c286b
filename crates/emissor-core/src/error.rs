//! Error taxonomy shared across the emission pipeline.
//!
//! Every pipeline step returns a typed error from its own module; the worker
//! folds those into [`EmissionError`] before deciding the next status
//! transition. Variants deliberately carry no certificate bytes, PFX
//! passwords, or contributor-secret tokens.

use thiserror::Error;

/// Top-level error for a single emission attempt.
///
/// The discriminant drives the state machine: some variants are terminal
/// (`BusinessRejection`, `Fatal`), some are retryable (`Transport`,
/// `AuthorityUnavailable`), and some are only meaningful at intake
/// (`Validation`, `IdempotencyConflict`).
#[derive(Debug, Error)]
pub enum EmissionError {
    /// The caller-supplied payload failed validation.
    #[error("invalid payload: {0}")]
    Validation(String),

    /// A replayed idempotency key arrived with a different payload.
    #[error("idempotency key already used with a different payload")]
    IdempotencyConflict,

    /// Key material could not be decoded or used. Not retryable.
    #[error("key material unavailable: {0}")]
    KeyMaterial(String),

    /// Enveloped signature construction failed. Not retryable.
    #[error("signature failure: {0}")]
    Signature(String),

    /// The document failed XSD validation before or after signing.
    /// Indicates an assembler or signer bug; not retryable.
    #[error("schema failure: {0}")]
    Schema(String),

    /// The authority could not be reached (timeout, TLS, reset, non-2xx).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The authority answered but reported itself unavailable.
    #[error("authority unavailable (cStat={cstat}): {reason}")]
    AuthorityUnavailable {
        /// Status code returned by the authority.
        cstat: u16,
        /// Human-readable reason from `xMotivo`.
        reason: String,
    },

    /// The authority explicitly refused the document. Terminal.
    #[error("business rejection (cStat={cstat}): {reason}")]
    BusinessRejection {
        /// Status code returned by the authority.
        cstat: u16,
        /// Human-readable reason from `xMotivo`.
        reason: String,
    },

    /// Store, broker, or object-store failure outside the pipeline's
    /// control. The record stays in its last persisted state.
    #[error("infrastructure failure: {0}")]
    Infra(String),
}

impl EmissionError {
    /// Whether the scheduler may plan another attempt for this error.
    ///
    /// `Infra` is neither retryable nor fatal: the record stays in its
    /// last persisted state and the broker redelivers the job.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::AuthorityUnavailable { .. })
    }

    /// Whether the error is terminal regardless of the retry budget.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::KeyMaterial(_)
                | Self::Signature(_)
                | Self::Schema(_)
                | Self::BusinessRejection { .. }
        )
    }
}

/// Synthetic reason code recorded when the retry budget is exhausted.
///
/// Distinct from every authority `cStat` so that a stored rejection code can
/// always be traced to its origin.
pub const BUDGET_EXHAUSTED_CODE: &str = "EMISSOR-498";

/// Human-readable message stored together with [`BUDGET_EXHAUSTED_CODE`].
pub const BUDGET_EXHAUSTED_REASON: &str = "retry budget exhausted before authorization";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_partitions_the_taxonomy() {
        let retryable = [
            EmissionError::Transport("timeout".to_string()),
            EmissionError::AuthorityUnavailable {
                cstat: 108,
                reason: "paralisado".to_string(),
            },
        ];
        for err in &retryable {
            assert!(err.is_retryable(), "{err} should be retryable");
            assert!(!err.is_fatal(), "{err} should not be fatal");
        }

        let fatal = [
            EmissionError::KeyMaterial("bad pfx".to_string()),
            EmissionError::Signature("sign failed".to_string()),
            EmissionError::Schema("missing block".to_string()),
            EmissionError::BusinessRejection {
                cstat: 204,
                reason: "duplicidade".to_string(),
            },
        ];
        for err in &fatal {
            assert!(err.is_fatal(), "{err} should be fatal");
            assert!(!err.is_retryable(), "{err} should not be retryable");
        }

        // Infra is neither: the record keeps its last persisted state.
        let infra = EmissionError::Infra("store down".to_string());
        assert!(!infra.is_retryable());
        assert!(!infra.is_fatal());
    }
}
