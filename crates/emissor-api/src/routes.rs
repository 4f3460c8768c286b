//! HTTP surface of the intake service.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use emissor_core::archive::Archiver;
use emissor_core::intake::{IntakeOutcome, IntakeService};
use emissor_core::model::{Event, Request, RequestStatus, SalePayload};
use emissor_core::queue::JobPublisher;
use emissor_core::store::RequestStore;
use emissor_core::EmissionError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shared handler state.
pub struct AppState {
    /// Intake service.
    pub intake: IntakeService,
    /// Read access to requests and events.
    pub requests: Arc<dyn RequestStore>,
    /// Broker handle, probed by the liveness endpoint.
    pub publisher: Arc<dyn JobPublisher>,
    /// Archived artifact access.
    pub archiver: Archiver,
}

/// Builds the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/nfce", post(emit))
        .route("/api/v1/nfce/:id", get(get_request))
        .route("/api/v1/nfce/:id/cancel", post(cancel))
        .route("/api/v1/nfce/:id/events", get(list_events))
        .route("/api/v1/nfce/:id/xml", get(download_xml))
        .route("/api/v1/nfce/:id/pdf", get(download_pdf))
        .route("/api/v1/nfce/:id/qrcode", get(download_qr))
        .route("/health", get(health))
        .with_state(state)
}

/// Caller-facing request view. Deliberately excludes the payload: it
/// carries the contributor-secret token.
#[derive(Debug, Serialize)]
struct RequestView {
    id: Uuid,
    status: RequestStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    series: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejection_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejection_reason: Option<String>,
    retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    authorized_at: Option<DateTime<Utc>>,
    in_contingency: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    contingency_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    links: Option<ArtifactLinks>,
}

#[derive(Debug, Serialize)]
struct ArtifactLinks {
    xml: String,
    pdf: String,
    qrcode: String,
}

impl RequestView {
    fn from_request(request: &Request) -> Self {
        let links = (request.status == RequestStatus::Authorized).then(|| ArtifactLinks {
            xml: format!("/api/v1/nfce/{}/xml", request.id),
            pdf: format!("/api/v1/nfce/{}/pdf", request.id),
            qrcode: format!("/api/v1/nfce/{}/qrcode", request.id),
        });
        Self {
            id: request.id,
            status: request.status,
            created_at: request.created_at,
            updated_at: request.updated_at,
            access_key: request.access_key.clone(),
            protocol: request.protocol.clone(),
            document_number: request.document_number,
            series: request.series,
            rejection_code: request.rejection_code.clone(),
            rejection_reason: request.rejection_reason.clone(),
            retry_count: request.retry_count,
            next_retry_at: request.next_retry_at,
            authorized_at: request.authorized_at,
            in_contingency: request.in_contingency,
            contingency_kind: request.contingency_kind.map(|kind| kind.as_str().to_string()),
            links,
        }
    }
}

#[derive(Debug, Serialize)]
struct EventView {
    status_from: RequestStatus,
    status_to: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    cstat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    created_at: DateTime<Utc>,
}

impl EventView {
    fn from_event(event: &Event) -> Self {
        Self {
            status_from: event.status_from,
            status_to: event.status_to,
            cstat: event.cstat.clone(),
            message: event.message.clone(),
            created_at: event.created_at,
        }
    }
}

fn error_body(message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": message.into() }))
}

fn map_error(err: &EmissionError) -> Response {
    match err {
        EmissionError::Validation(message) => {
            (StatusCode::BAD_REQUEST, error_body(message.clone())).into_response()
        },
        EmissionError::IdempotencyConflict => (
            StatusCode::CONFLICT,
            error_body("idempotency key already used with a different payload"),
        )
            .into_response(),
        EmissionError::Infra(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("dependency unavailable, try again"),
        )
            .into_response(),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body(other.to_string()),
        )
            .into_response(),
    }
}

async fn emit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SalePayload>,
) -> Response {
    let Some(key) = headers
        .get("idempotency-key")
        .and_then(|value| value.to_str().ok())
    else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("Idempotency-Key header is required"),
        )
            .into_response();
    };

    match state.intake.submit(key, payload).await {
        Ok(IntakeOutcome::Accepted(request)) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "id": request.id,
                "status": request.status,
                "created_at": request.created_at,
            })),
        )
            .into_response(),
        Ok(IntakeOutcome::Existing(request)) => {
            (StatusCode::OK, Json(RequestView::from_request(&request))).into_response()
        },
        Ok(IntakeOutcome::AlreadyRejected(request)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "error": "request was rejected; submit again under a new idempotency key",
                "request": RequestView::from_request(&request),
            })),
        )
            .into_response(),
        Err(err) => map_error(&err),
    }
}

async fn get_request(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.requests.get(id).await {
        Ok(Some(request)) => {
            (StatusCode::OK, Json(RequestView::from_request(&request))).into_response()
        },
        Ok(None) => (StatusCode::NOT_FOUND, error_body("request not found")).into_response(),
        Err(err) => map_error(&EmissionError::Infra(err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    justification: String,
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelBody>,
) -> Response {
    match state.intake.cancel(id, &body.justification).await {
        Ok(Some(request)) => {
            (StatusCode::ACCEPTED, Json(RequestView::from_request(&request))).into_response()
        },
        Ok(None) => (StatusCode::NOT_FOUND, error_body("request not found")).into_response(),
        Err(err) => map_error(&err),
    }
}

async fn list_events(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.requests.events(id).await {
        Ok(events) => {
            let views: Vec<EventView> = events.iter().map(EventView::from_event).collect();
            (StatusCode::OK, Json(views)).into_response()
        },
        Err(err) => map_error(&EmissionError::Infra(err.to_string())),
    }
}

enum ArtifactKind {
    Xml,
    Pdf,
    Qr,
}

async fn download_artifact(
    state: &AppState,
    id: Uuid,
    kind: &ArtifactKind,
) -> Response {
    let request = match state.requests.get(id).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, error_body("request not found")).into_response()
        },
        Err(err) => return map_error(&EmissionError::Infra(err.to_string())),
    };

    // Artifacts exist only after authorization (and survive cancellation).
    let authorized = matches!(
        request.status,
        RequestStatus::Authorized | RequestStatus::Canceled
    );
    let Some(access_key) = request.access_key.filter(|_| authorized) else {
        return (
            StatusCode::NOT_FOUND,
            error_body("document is not authorized yet"),
        )
            .into_response();
    };

    let (key, content_type) = match kind {
        ArtifactKind::Xml => (
            Archiver::xml_key(request.company_id, &access_key),
            "application/xml",
        ),
        ArtifactKind::Pdf => (
            Archiver::pdf_key(request.company_id, &access_key),
            "application/pdf",
        ),
        ArtifactKind::Qr => (
            Archiver::qr_key(request.company_id, &access_key),
            "image/png",
        ),
    };

    match state.archiver.fetch(&key).await {
        Ok(Some(bytes)) => {
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        },
        Ok(None) => (StatusCode::NOT_FOUND, error_body("artifact not archived")).into_response(),
        Err(err) => map_error(&EmissionError::Infra(err.to_string())),
    }
}

async fn download_xml(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    download_artifact(&state, id, &ArtifactKind::Xml).await
}

async fn download_pdf(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    download_artifact(&state, id, &ArtifactKind::Pdf).await
}

async fn download_qr(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    download_artifact(&state, id, &ArtifactKind::Qr).await
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    // A nil lookup exercises the store round trip without touching data.
    let store_ok = state.requests.get(Uuid::nil()).await.is_ok();
    let queue_ok = state.publisher.healthy().await;

    let status = if store_ok && queue_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if store_ok && queue_ok { "ok" } else { "degraded" },
            "store": store_ok,
            "queue": queue_ok,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use emissor_core::queue::MemoryQueue;
    use emissor_core::storage::LocalStorage;
    use emissor_core::store::MemoryStore;

    use super::*;

    fn state() -> (Arc<AppState>, Arc<MemoryQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let storage = Arc::new(LocalStorage::new(
            std::env::temp_dir().join("emissor-api-tests"),
            "http://files".to_string(),
        ));
        let state = Arc::new(AppState {
            intake: IntakeService::new(store.clone(), queue.clone()),
            requests: store,
            publisher: queue.clone(),
            archiver: Archiver::new(storage),
        });
        (state, queue)
    }

    #[test]
    fn router_builds() {
        let (state, _queue) = state();
        let _router = router(state);
    }

    #[tokio::test]
    async fn health_reflects_backend_reachability() {
        let (state, queue) = state();

        let response = health(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        queue.fail_publishes(true);
        let response = health(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn view_hides_payload_and_links_follow_status() {
        let request = Request::new(
            "key".to_string(),
            serde_json::from_value(sample_payload_json()).unwrap(),
        );
        let view = RequestView::from_request(&request);
        assert!(view.links.is_none());

        let serialized = serde_json::to_value(&view).unwrap();
        assert!(serialized.get("payload").is_none());
        assert_eq!(serialized["status"], "pending");
    }

    fn sample_payload_json() -> serde_json::Value {
        serde_json::json!({
            "company_id": Uuid::new_v4(),
            "uf": "SP",
            "environment": "homologation",
            "issuer": {
                "cnpj": "12345678000195",
                "csc_id": "000001",
                "csc_token": "TOKEN"
            },
            "items": [{
                "description": "CANETA",
                "ncm": "84713019",
                "cfop": "5102",
                "unit": "UN",
                "quantity": "1",
                "unit_price": "29.90"
            }],
            "payments": [{ "method": "01", "amount": "29.90" }]
        })
    }
}
