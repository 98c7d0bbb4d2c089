use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tracing::warn;

use crate::reconciliation::{AuditLog, InvoiceRepository};

use super::domain::WebhookEventRepository;
use super::service::{IngestOutcome, WebhookError, WebhookIngestion};
use super::signature::SIGNATURE_HEADER;

/// Router exposing the inbound registry webhook endpoint.
pub fn webhook_router<R, L, W>(ingestion: Arc<WebhookIngestion<R, L, W>>) -> Router
where
    R: InvoiceRepository + 'static,
    L: AuditLog + 'static,
    W: WebhookEventRepository + 'static,
{
    Router::new()
        .route("/webhooks/registry", post(receive_handler::<R, L, W>))
        .with_state(ingestion)
}

pub(crate) async fn receive_handler<R, L, W>(
    State(ingestion): State<Arc<WebhookIngestion<R, L, W>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    R: InvoiceRepository + 'static,
    L: AuditLog + 'static,
    W: WebhookEventRepository + 'static,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match ingestion.handle(&body, signature) {
        Ok(IngestOutcome::Accepted) => {
            (StatusCode::OK, Json(json!({ "status": "accepted" }))).into_response()
        }
        Ok(IngestOutcome::Duplicate) => {
            (StatusCode::OK, Json(json!({ "status": "duplicate" }))).into_response()
        }
        Err(WebhookError::Signature(err)) => {
            warn!(error = %err, "webhook rejected: bad signature");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid signature" })),
            )
                .into_response()
        }
        Err(WebhookError::Malformed(detail)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": detail })),
        )
            .into_response(),
        Err(err) => {
            // Transient processing failure; a non-2xx tells the registry to
            // redeliver later.
            warn!(error = %err, "webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
