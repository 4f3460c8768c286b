//! Interpretation of authority responses and the retry policy.
//!
//! The authority's numeric `cStat` is the sole signal driving the state
//! machine. [`interpret`] maps a code into the action the worker takes;
//! [`RetryPolicy`] bounds how often and for how long transient failures are
//! retried.

mod backoff;

pub use backoff::RetryPolicy;

use crate::sefaz::AuthorityReply;

/// What the worker should do with an authority reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted family: persist protocol and archive.
    Authorized {
        /// Authority protocol number.
        protocol: String,
    },
    /// Permanent refusal: record the code and stop.
    Rejected {
        /// Authority status code.
        cstat: u16,
        /// Authority reason.
        reason: String,
        /// Whether the code indicates an assembler/signer bug (schema
        /// bucket) rather than a business refusal.
        fatal: bool,
    },
    /// The authority is unavailable; switch to a contingency service and
    /// re-run immediately.
    SwitchToContingency {
        /// Authority status code that triggered the switch.
        cstat: u16,
        /// Authority reason.
        reason: String,
    },
    /// Transient condition; schedule another attempt within the budget.
    Retry {
        /// Authority status code, when the authority answered at all.
        cstat: Option<u16>,
        /// Failure description.
        reason: String,
    },
}

/// Maps an authority reply to an [`Outcome`].
///
/// `in_contingency` reports whether the current attempt already went to a
/// contingency endpoint; a second unavailability is then a plain retry
/// instead of another switch.
#[must_use]
pub fn interpret(reply: &AuthorityReply, in_contingency: bool) -> Outcome {
    let cstat = reply.cstat;
    let reason = reply.reason.clone();

    match cstat {
        // Service paralyzed: part of the 10x family but explicitly an
        // unavailability signal, handled before the authorized range.
        108 | 109 | 500..=599 => {
            if in_contingency {
                Outcome::Retry {
                    cstat: Some(cstat),
                    reason,
                }
            } else {
                Outcome::SwitchToContingency { cstat, reason }
            }
        },
        100..=107 => Outcome::Authorized {
            protocol: reply.protocol.clone().unwrap_or_default(),
        },
        110..=119 => Outcome::Rejected {
            cstat,
            reason,
            fatal: false,
        },
        200..=399 => Outcome::Rejected {
            cstat,
            reason,
            fatal: false,
        },
        400..=499 => Outcome::Rejected {
            cstat,
            reason,
            fatal: true,
        },
        691..=693 => Outcome::Retry {
            cstat: Some(cstat),
            reason,
        },
        _ => Outcome::Retry {
            cstat: Some(cstat),
            reason,
        },
    }
}
