//! The SOAP submission client.
//!
//! One transport attempt per call; higher-level retry belongs to the
//! response interpreter and the scheduler. The transport is a trait so the
//! pipeline can be driven against scripted replies in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::endpoints;
use super::envelope;
use super::AuthorityReply;
use crate::model::{ContingencyKind, Environment, Uf};

/// Errors talking to the authority.
#[derive(Debug, Error)]
pub enum SefazError {
    /// Timeout, TLS failure, connection reset, or a non-2xx answer.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The authority answered 2xx with a body carrying no `cStat`.
    #[error("malformed authority response: {0}")]
    MalformedResponse(String),
}

/// Where a submission goes.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionTarget {
    /// Emitter state.
    pub uf: Uf,
    /// Emission environment.
    pub environment: Environment,
    /// Contingency family, when the pipeline switched over.
    pub contingency: Option<ContingencyKind>,
}

impl SubmissionTarget {
    /// Resolves the endpoint for this submission.
    #[must_use]
    pub fn endpoint(&self) -> &'static str {
        match self.contingency {
            Some(kind) => endpoints::contingency(kind, self.environment),
            None => endpoints::authorization(self.uf, self.environment),
        }
    }
}

/// Raw SOAP transport: post an envelope, get the response body.
#[async_trait]
pub trait SoapTransport: Send + Sync {
    /// Posts the envelope and returns the response body on HTTP success.
    ///
    /// # Errors
    ///
    /// [`SefazError::Transport`] on connection failure or non-2xx status.
    async fn post(&self, endpoint: &str, soap_envelope: &str) -> Result<Vec<u8>, SefazError>;
}

/// Production transport over HTTPS with a bounded deadline.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds the transport with the given per-call deadline.
    ///
    /// # Errors
    ///
    /// [`SefazError::Transport`] when the TLS backend cannot initialize.
    pub fn new(timeout: Duration) -> Result<Self, SefazError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(15)))
            .build()
            .map_err(|err| SefazError::Transport(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SoapTransport for HttpTransport {
    async fn post(&self, endpoint: &str, soap_envelope: &str) -> Result<Vec<u8>, SefazError> {
        let response = self
            .client
            .post(endpoint)
            .header("content-type", "application/soap+xml; charset=utf-8")
            .body(soap_envelope.to_string())
            .send()
            .await
            .map_err(|err| SefazError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SefazError::Transport(format!(
                "{endpoint} answered {status}"
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| SefazError::Transport(err.to_string()))?;
        Ok(body.to_vec())
    }
}

/// Authorization client over a pluggable transport.
pub struct SefazClient {
    transport: Arc<dyn SoapTransport>,
}

impl SefazClient {
    /// Wraps a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn SoapTransport>) -> Self {
        Self { transport }
    }

    /// Submits a signed document for authorization.
    ///
    /// A response that parses to no `cStat` is retried once at the
    /// transport level before surfacing as malformed.
    ///
    /// # Errors
    ///
    /// [`SefazError::Transport`] and [`SefazError::MalformedResponse`].
    pub async fn authorize(
        &self,
        target: &SubmissionTarget,
        signed_document: &[u8],
    ) -> Result<AuthorityReply, SefazError> {
        let endpoint = target.endpoint();
        let soap_envelope = envelope::authorization_envelope(target.uf, signed_document);
        debug!(endpoint, contingency = ?target.contingency, "submitting authorization lot");

        let mut last_body_len = 0;
        for attempt in 0..2 {
            let body = self.transport.post(endpoint, &soap_envelope).await?;
            last_body_len = body.len();
            if let Some(reply) = envelope::parse_authority_reply(&body) {
                return Ok(reply);
            }
            if attempt == 0 {
                warn!(endpoint, "authority response carried no cStat, retrying once");
            }
        }
        Err(SefazError::MalformedResponse(format!(
            "no cStat in {last_body_len}-byte response from {endpoint}"
        )))
    }

    /// Queries the status service of the emitter's authority.
    ///
    /// # Errors
    ///
    /// [`SefazError::Transport`] and [`SefazError::MalformedResponse`].
    pub async fn status_service(
        &self,
        uf: Uf,
        environment: Environment,
    ) -> Result<AuthorityReply, SefazError> {
        let endpoint = endpoints::authorization(uf, environment);
        let soap_envelope = envelope::status_envelope(uf, environment.tp_amb());
        let body = self.transport.post(endpoint, &soap_envelope).await?;
        envelope::parse_authority_reply(&body).ok_or_else(|| {
            SefazError::MalformedResponse(format!("no cStat in status reply from {endpoint}"))
        })
    }
}
