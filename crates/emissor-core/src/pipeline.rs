//! The emission pipeline: one job in, one persisted outcome out.
//!
//! Inside a job the steps are sequential: claim, number, assemble, validate,
//! sign, validate again, submit, interpret, archive. The claim and every
//! status change are compare-and-set transitions; losing a race means
//! another worker owns the record and this delivery is dropped silently.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use secrecy::SecretString;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{ArtifactUrls, Archiver, Artifacts};
use crate::error::{EmissionError, BUDGET_EXHAUSTED_CODE, BUDGET_EXHAUSTED_REASON};
use crate::fiscal::access_key::{self, AccessKeyParts};
use crate::fiscal::assembler::{build_document, DocumentInput, EmissionKind};
use crate::fiscal::keymat::KeyMaterial;
use crate::fiscal::validator::DocumentValidator;
use crate::fiscal::{danfe, qr, signer};
use crate::machine::{interpret, Outcome, RetryPolicy};
use crate::model::{
    Company, ContingencyKind, ContributorSecret, Event, Request, RequestStatus,
};
use crate::sefaz::{endpoints, SefazClient, SefazError, SubmissionTarget};
use crate::store::{CompanyStore, RequestStore, RequestUpdate, SequenceService, StoreError};

/// Justification recorded in `xJust` when emitting under contingency.
const CONTINGENCY_JUSTIFICATION: &str =
    "Indisponibilidade do servico de autorizacao da UF de origem";

/// Everything the pipeline depends on.
pub struct PipelineDeps {
    /// Request store.
    pub requests: Arc<dyn RequestStore>,
    /// Company configuration provider.
    pub companies: Arc<dyn CompanyStore>,
    /// Document numbering.
    pub sequences: Arc<dyn SequenceService>,
    /// Pre/post-signature validator.
    pub validator: Arc<dyn DocumentValidator>,
    /// Authority client.
    pub sefaz: SefazClient,
    /// Artifact archiver.
    pub archiver: Archiver,
    /// Retry budget.
    pub policy: RetryPolicy,
}

/// The worker-side emission pipeline.
pub struct EmissionPipeline {
    requests: Arc<dyn RequestStore>,
    companies: Arc<dyn CompanyStore>,
    sequences: Arc<dyn SequenceService>,
    validator: Arc<dyn DocumentValidator>,
    sefaz: SefazClient,
    archiver: Archiver,
    policy: RetryPolicy,
    software_version: String,
}

/// What one submission attempt concluded when it did not error.
///
/// Failures travel as [`EmissionError`] variants; a contingency switch is
/// control flow, not an error.
enum AttemptOutcome {
    Authorized(Box<Authorization>),
    Switch { cstat: u16, reason: String },
}

struct Authorization {
    access_key: String,
    protocol: String,
    number: i64,
    series: u16,
    cstat: u16,
    reason: String,
    urls: ArtifactUrls,
}

/// Emission timestamps are rendered in the Brasília offset.
fn emission_offset() -> FixedOffset {
    FixedOffset::west_opt(3 * 3600).expect("static offset")
}

fn infra(err: StoreError) -> EmissionError {
    EmissionError::Infra(err.to_string())
}

impl EmissionPipeline {
    /// Assembles the pipeline.
    #[must_use]
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            requests: deps.requests,
            companies: deps.companies,
            sequences: deps.sequences,
            validator: deps.validator,
            sefaz: deps.sefaz,
            archiver: deps.archiver,
            policy: deps.policy,
            software_version: format!("emissor {}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Drives one job to a persisted outcome.
    ///
    /// Redeliveries of finished requests are dropped; claim races are lost
    /// silently. Only infrastructure failures bubble out, leaving the
    /// record in its last persisted state for the scheduler to revive.
    ///
    /// # Errors
    ///
    /// [`EmissionError::Infra`] when the store or broker fails mid-job.
    pub async fn process(&self, request_id: Uuid) -> Result<(), EmissionError> {
        let Some(mut request) = self.requests.get(request_id).await.map_err(infra)? else {
            warn!(%request_id, "job references an unknown request");
            return Ok(());
        };

        match request.status {
            RequestStatus::Authorized | RequestStatus::Rejected | RequestStatus::Canceled => {
                debug!(%request_id, status = %request.status, "request already terminal");
                return Ok(());
            },
            // The retry poller claims `retrying -> processing` before
            // republishing, so a redelivered claim is already ours.
            RequestStatus::Processing => {},
            from @ (RequestStatus::Pending
            | RequestStatus::Retrying
            | RequestStatus::Contingency) => {
                let won = self
                    .requests
                    .transition(
                        request.id,
                        from,
                        RequestStatus::Processing,
                        RequestUpdate::default(),
                    )
                    .await
                    .map_err(infra)?;
                if !won {
                    debug!(%request_id, "lost the claim race");
                    return Ok(());
                }
                self.record(Event::transition(request.id, from, RequestStatus::Processing))
                    .await;
                request.status = RequestStatus::Processing;
            },
        }

        let Some(company) = self
            .companies
            .get(request.company_id)
            .await
            .map_err(infra)?
        else {
            return self
                .reject(&request, None, "issuing company not found".to_string())
                .await;
        };

        let mut contingency = request.contingency_kind.filter(|_| request.in_contingency);
        loop {
            match self.attempt(&request, &company, contingency).await {
                Ok(AttemptOutcome::Authorized(authorization)) => {
                    return self.persist_authorized(&request, *authorization).await;
                },
                Err(EmissionError::BusinessRejection { cstat, reason }) => {
                    return self.reject(&request, Some(cstat.to_string()), reason).await;
                },
                Err(EmissionError::AuthorityUnavailable { cstat, reason }) => {
                    return self.schedule_retry(&request, Some(cstat), reason).await;
                },
                Err(err) if err.is_retryable() => {
                    return self.schedule_retry(&request, None, err.to_string()).await;
                },
                Err(err) if err.is_fatal() => {
                    return self.reject(&request, None, err.to_string()).await;
                },
                Ok(AttemptOutcome::Switch { cstat, reason }) => {
                    let kind = endpoints::contingency_for(request.payload.uf);
                    info!(%request_id, cstat, kind = kind.as_str(),
                        "authority unavailable, switching to contingency");

                    let marked = self
                        .requests
                        .transition(
                            request.id,
                            RequestStatus::Processing,
                            RequestStatus::Contingency,
                            RequestUpdate {
                                in_contingency: Some(true),
                                contingency_kind: Some(kind),
                                ..RequestUpdate::default()
                            },
                        )
                        .await
                        .map_err(infra)?;
                    if !marked {
                        warn!(%request_id, "contingency switch lost a status race");
                        return Ok(());
                    }
                    self.record(
                        Event::transition(
                            request.id,
                            RequestStatus::Processing,
                            RequestStatus::Contingency,
                        )
                        .with_cstat(cstat.to_string())
                        .with_message(reason),
                    )
                    .await;

                    // Immediate re-run, not a scheduled retry.
                    let resumed = self
                        .requests
                        .transition(
                            request.id,
                            RequestStatus::Contingency,
                            RequestStatus::Processing,
                            RequestUpdate::default(),
                        )
                        .await
                        .map_err(infra)?;
                    if !resumed {
                        warn!(%request_id, "contingency resume lost a status race");
                        return Ok(());
                    }
                    self.record(Event::transition(
                        request.id,
                        RequestStatus::Contingency,
                        RequestStatus::Processing,
                    ))
                    .await;

                    request.in_contingency = true;
                    request.contingency_kind = Some(kind);
                    contingency = Some(kind);
                },
                // Infrastructure failures bubble out; the record keeps its
                // last persisted state and the broker redelivers.
                Err(err) => return Err(err),
            }
        }
    }

    /// One assemble-sign-submit attempt against one endpoint family.
    ///
    /// Every failing step returns its tagged [`EmissionError`] variant;
    /// the caller decides between rejection, a scheduled retry, and
    /// bubbling out based on the variant.
    async fn attempt(
        &self,
        request: &Request,
        company: &Company,
        contingency: Option<ContingencyKind>,
    ) -> Result<AttemptOutcome, EmissionError> {
        let payload = &request.payload;
        let series = payload.series;
        let number = self
            .sequences
            .next_number(request.company_id, series)
            .await
            .map_err(infra)?;

        let issued_at: DateTime<FixedOffset> = Utc::now().with_timezone(&emission_offset());
        let random_code = access_key::random_code();
        let emission = match contingency {
            None => EmissionKind::Normal,
            Some(kind) => EmissionKind::Contingency {
                kind,
                since: issued_at,
                justification: CONTINGENCY_JUSTIFICATION,
            },
        };

        let key = access_key::build(&AccessKeyParts {
            uf: payload.uf,
            cnpj: &payload.issuer.cnpj,
            series,
            number,
            emission_kind: emission.tp_emis(),
            random_code,
            issued_at,
        })
        .map_err(|err| EmissionError::Schema(format!("access key: {err}")))?;

        let document = build_document(&DocumentInput {
            payload,
            company,
            access_key: &key,
            number,
            series,
            random_code,
            issued_at,
            emission,
            software_version: &self.software_version,
        })
        .map_err(|err| EmissionError::Schema(format!("assembler: {err}")))?;

        self.validator
            .validate(&document)
            .map_err(|err| EmissionError::Schema(format!("pre-signature: {err}")))?;

        // Key material lives exactly as long as the signing call.
        let signed = {
            let material = KeyMaterial::from_certificate(&company.certificate)
                .map_err(|err| EmissionError::KeyMaterial(err.to_string()))?;
            signer::sign_enveloped(&document, &format!("NFe{key}"), &material)
                .map_err(|err| EmissionError::Signature(err.to_string()))?
        };

        self.validator
            .validate(&signed)
            .map_err(|err| EmissionError::Schema(format!("post-signature: {err}")))?;

        let target = SubmissionTarget {
            uf: payload.uf,
            environment: payload.environment,
            contingency,
        };
        let reply = self.sefaz.authorize(&target, &signed).await.map_err(|err| {
            match err {
                SefazError::Transport(reason) | SefazError::MalformedResponse(reason) => {
                    EmissionError::Transport(reason)
                },
            }
        })?;

        match interpret(&reply, contingency.is_some()) {
            Outcome::Authorized { protocol } => {
                let urls = self
                    .build_and_archive_artifacts(
                        request, company, &key, &signed, issued_at, number, series, &protocol,
                        contingency,
                    )
                    .await;
                Ok(AttemptOutcome::Authorized(Box::new(Authorization {
                    access_key: key,
                    protocol,
                    number,
                    series,
                    cstat: reply.cstat,
                    reason: reply.reason,
                    urls,
                })))
            },
            Outcome::Rejected { cstat, reason, fatal } => {
                if fatal {
                    error!(request_id = %request.id, cstat,
                        "schema-bucket rejection indicates an assembler defect");
                }
                Err(EmissionError::BusinessRejection { cstat, reason })
            },
            Outcome::SwitchToContingency { cstat, reason } => {
                Ok(AttemptOutcome::Switch { cstat, reason })
            },
            Outcome::Retry { cstat, reason } => Err(match cstat {
                Some(cstat) => EmissionError::AuthorityUnavailable { cstat, reason },
                None => EmissionError::Transport(reason),
            }),
        }
    }

    /// Renders QR and DANFE and puts all artifacts; failures only log.
    #[allow(clippy::too_many_arguments)]
    async fn build_and_archive_artifacts(
        &self,
        request: &Request,
        company: &Company,
        access_key: &str,
        signed: &[u8],
        issued_at: DateTime<FixedOffset>,
        number: i64,
        series: u16,
        protocol: &str,
        contingency: Option<ContingencyKind>,
    ) -> ArtifactUrls {
        let payload = &request.payload;
        let issued_at_text = issued_at.format("%Y-%m-%dT%H:%M:%S%:z").to_string();

        let digest = match signer::digest_value(signed) {
            Ok(digest) => digest,
            Err(err) => {
                error!(%access_key, error = %err, "signed document carries no digest");
                return ArtifactUrls::default();
            },
        };

        let csc = if payload.issuer.csc_token.is_empty() {
            company.csc.clone()
        } else {
            ContributorSecret {
                id: payload.issuer.csc_id.clone(),
                token: SecretString::new(payload.issuer.csc_token.clone()),
            }
        };

        let qr_url = match qr::build_url(&qr::QrInput {
            access_key,
            environment: payload.environment,
            consumer_tax_id: payload.consumer_tax_id.as_deref(),
            issued_at: &issued_at_text,
            total: payload.items_total(),
            icms_total: payload.icms_total(),
            digest_value: &digest,
            csc: &csc,
            uf: payload.uf,
        }) {
            Ok(url) => url,
            Err(err) => {
                error!(%access_key, error = %err, "qr url build failed");
                return ArtifactUrls::default();
            },
        };

        let qr_png = qr::render_png(&qr_url).unwrap_or_else(|err| {
            warn!(%access_key, error = %err, "qr image rendering failed");
            Vec::new()
        });

        let pdf = danfe::render(&danfe::DanfeInput {
            company,
            items: &payload.items,
            payments: &payload.payments,
            total: payload.items_total(),
            access_key,
            protocol,
            authorized_at: &issued_at_text,
            number,
            series,
            environment: payload.environment,
            qr_url: &qr_url,
            contingency,
        })
        .unwrap_or_else(|err| {
            warn!(%access_key, error = %err, "danfe rendering failed");
            Vec::new()
        });

        self.archiver
            .archive(
                request.company_id,
                access_key,
                Artifacts {
                    signed_xml: signed,
                    danfe_pdf: &pdf,
                    qr_png: &qr_png,
                },
            )
            .await
    }

    async fn persist_authorized(
        &self,
        request: &Request,
        authorization: Authorization,
    ) -> Result<(), EmissionError> {
        let now = Utc::now();
        let won = self
            .requests
            .transition(
                request.id,
                RequestStatus::Processing,
                RequestStatus::Authorized,
                RequestUpdate {
                    access_key: Some(authorization.access_key.clone()),
                    protocol: Some(authorization.protocol.clone()),
                    document_number: Some(authorization.number),
                    series: Some(authorization.series),
                    processed_at: Some(now),
                    authorized_at: Some(now),
                    next_retry_at: Some(None),
                    xml_url: authorization.urls.xml,
                    pdf_url: authorization.urls.pdf,
                    qr_url: authorization.urls.qr,
                    ..RequestUpdate::default()
                },
            )
            .await
            .map_err(infra)?;
        if !won {
            warn!(request_id = %request.id, "authorization lost a status race");
            return Ok(());
        }

        self.record(
            Event::transition(
                request.id,
                RequestStatus::Processing,
                RequestStatus::Authorized,
            )
            .with_cstat(authorization.cstat.to_string())
            .with_message(authorization.reason)
            .with_metadata(serde_json::json!({
                "protocol": authorization.protocol,
                "access_key": authorization.access_key,
            })),
        )
        .await;

        info!(request_id = %request.id, access_key = %authorization.access_key,
            protocol = %authorization.protocol, "document authorized");
        Ok(())
    }

    async fn reject(
        &self,
        request: &Request,
        code: Option<String>,
        reason: String,
    ) -> Result<(), EmissionError> {
        let won = self
            .requests
            .transition(
                request.id,
                RequestStatus::Processing,
                RequestStatus::Rejected,
                RequestUpdate {
                    rejection_code: code.clone(),
                    rejection_reason: Some(reason.clone()),
                    processed_at: Some(Utc::now()),
                    next_retry_at: Some(None),
                    ..RequestUpdate::default()
                },
            )
            .await
            .map_err(infra)?;
        if !won {
            warn!(request_id = %request.id, "rejection lost a status race");
            return Ok(());
        }

        let mut event = Event::transition(
            request.id,
            RequestStatus::Processing,
            RequestStatus::Rejected,
        )
        .with_message(reason.clone());
        if let Some(code) = code.clone() {
            event = event.with_cstat(code);
        }
        self.record(event).await;

        info!(request_id = %request.id, code = code.as_deref().unwrap_or("-"),
            %reason, "document rejected");
        Ok(())
    }

    async fn schedule_retry(
        &self,
        request: &Request,
        cstat: Option<u16>,
        reason: String,
    ) -> Result<(), EmissionError> {
        let now = Utc::now();

        if !self
            .policy
            .allows_retry(request.retry_count, request.created_at, now)
        {
            return self
                .reject(
                    request,
                    Some(BUDGET_EXHAUSTED_CODE.to_string()),
                    format!("{BUDGET_EXHAUSTED_REASON} (last failure: {reason})"),
                )
                .await;
        }

        let next_count = request.retry_count + 1;
        let delay = self.policy.delay_for(next_count);
        let next_retry_at = now
            + chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let won = self
            .requests
            .transition(
                request.id,
                RequestStatus::Processing,
                RequestStatus::Retrying,
                RequestUpdate {
                    retry_count: Some(next_count),
                    next_retry_at: Some(Some(next_retry_at)),
                    ..RequestUpdate::default()
                },
            )
            .await
            .map_err(infra)?;
        if !won {
            warn!(request_id = %request.id, "retry scheduling lost a status race");
            return Ok(());
        }

        let mut event = Event::transition(
            request.id,
            RequestStatus::Processing,
            RequestStatus::Retrying,
        )
        .with_message(reason.clone())
        .with_metadata(serde_json::json!({
            "retry_count": next_count,
            "next_retry_at": next_retry_at.to_rfc3339(),
        }));
        if let Some(cstat) = cstat {
            event = event.with_cstat(cstat.to_string());
        }
        self.record(event).await;

        info!(request_id = %request.id, retry = next_count,
            next_retry_at = %next_retry_at, %reason, "retry scheduled");
        Ok(())
    }

    /// Appends an event; a failed append degrades to a log line rather than
    /// failing a job whose status transition already committed.
    async fn record(&self, event: Event) {
        if let Err(err) = self.requests.append_event(&event).await {
            error!(request_id = %event.request_id, error = %err, "event append failed");
        }
    }
}
