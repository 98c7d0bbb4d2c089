use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use einvoice::credentials::{
    CredentialError, CredentialStore, Merchant, MerchantId, MerchantRepository, Secret,
};
use einvoice::polling::{PollingSweep, SweepConfig, SweepError, SweepSummary};
use einvoice::reconciliation::{
    Direction, EngineError, Invoice, InvoiceId, InvoiceRepository, InvoiceStatusView,
    RepositoryError, TransitionOutcome,
};
use einvoice::registry::{HttpRegistryClient, RegistryError};
use einvoice::submission::{SubmissionError, SubmissionService};
use einvoice::webhooks::{webhook_router, WebhookIngestion};

use crate::infra::{
    AppState, InMemoryAuditLog, InMemoryInvoiceRepository, InMemoryMerchantRepository,
    InMemoryWebhookEventRepository, OAuthStateStore,
};

pub(crate) type Submission = SubmissionService<
    InMemoryInvoiceRepository,
    InMemoryAuditLog,
    InMemoryMerchantRepository,
    HttpRegistryClient,
>;
pub(crate) type Sweep = PollingSweep<
    InMemoryInvoiceRepository,
    InMemoryAuditLog,
    InMemoryMerchantRepository,
    HttpRegistryClient,
>;
pub(crate) type Ingestion =
    WebhookIngestion<InMemoryInvoiceRepository, InMemoryAuditLog, InMemoryWebhookEventRepository>;

/// Everything the HTTP handlers need, shared as router state.
pub(crate) struct Services {
    pub(crate) invoices: Arc<InMemoryInvoiceRepository>,
    pub(crate) merchants: Arc<InMemoryMerchantRepository>,
    pub(crate) credentials: Arc<CredentialStore<InMemoryMerchantRepository, HttpRegistryClient>>,
    pub(crate) registry: Arc<HttpRegistryClient>,
    pub(crate) submission: Submission,
    pub(crate) sweep: Sweep,
    pub(crate) oauth_states: OAuthStateStore,
    pub(crate) sweep_defaults: SweepConfig,
    pub(crate) redirect_uri: String,
}

pub(crate) fn api_router(services: Arc<Services>, ingestion: Arc<Ingestion>) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/invoices", post(create_invoice))
        .route("/api/v1/invoices/:id", get(invoice_status))
        .route("/api/v1/invoices/:id/submit", post(submit_invoice))
        .route("/api/v1/invoices/:id/send", post(send_invoice))
        .route("/api/v1/merchants", post(create_merchant))
        .route("/api/v1/merchants/:id/connect", post(connect_merchant))
        .route(
            "/api/v1/merchants/:id/credentials",
            delete(revoke_credentials),
        )
        .route("/oauth/callback", get(oauth_callback))
        .route("/api/v1/polling/run", post(run_sweep))
        .with_state(services)
        .merge(webhook_router(ingestion))
}

/// Route-level failure with an HTTP status already decided.
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        let status = match err {
            RepositoryError::Conflict => StatusCode::CONFLICT,
            RepositoryError::NotFound => StatusCode::NOT_FOUND,
            RepositoryError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        let status = match &err {
            CredentialError::NotConnected => StatusCode::CONFLICT,
            CredentialError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match &err {
            RegistryError::Validation { .. } => StatusCode::BAD_REQUEST,
            RegistryError::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::InvoiceNotFound => StatusCode::NOT_FOUND,
            EngineError::Contention { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<SubmissionError> for ApiError {
    fn from(err: SubmissionError) -> Self {
        match err {
            SubmissionError::InvoiceNotFound => ApiError::not_found("invoice not found"),
            SubmissionError::NotSubmitted => Self::new(
                StatusCode::CONFLICT,
                "invoice has not been submitted to the registry yet",
            ),
            SubmissionError::Credential(inner) => inner.into(),
            SubmissionError::Registry(inner) => inner.into(),
            SubmissionError::Engine(inner) => inner.into(),
            SubmissionError::Repository(inner) => inner.into(),
        }
    }
}

impl From<SweepError> for ApiError {
    fn from(err: SweepError) -> Self {
        match err {
            SweepError::Credential(inner) => inner.into(),
            SweepError::Registry(inner) => inner.into(),
            SweepError::Repository(inner) => inner.into(),
            SweepError::Audit(inner) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, inner.to_string())
            }
        }
    }
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateInvoiceRequest {
    pub(crate) invoice_id: String,
    pub(crate) merchant_id: String,
    #[serde(default)]
    pub(crate) direction: Option<Direction>,
}

pub(crate) async fn create_invoice(
    State(services): State<Arc<Services>>,
    Json(payload): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceStatusView>), ApiError> {
    let merchant_id = MerchantId(payload.merchant_id);
    if services.merchants.fetch(&merchant_id)?.is_none() {
        return Err(ApiError::not_found("unknown merchant"));
    }

    let invoice = Invoice::draft(
        InvoiceId(payload.invoice_id),
        merchant_id,
        payload.direction.unwrap_or(Direction::Outgoing),
    );
    let stored = services.invoices.insert(invoice)?;
    Ok((StatusCode::CREATED, Json(stored.status_view())))
}

pub(crate) async fn invoice_status(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> Result<Json<InvoiceStatusView>, ApiError> {
    let invoice = services
        .invoices
        .fetch(&InvoiceId(id))?
        .ok_or_else(|| ApiError::not_found("invoice not found"))?;
    Ok(Json(invoice.status_view()))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubmitInvoiceRequest {
    pub(crate) document: serde_json::Value,
}

pub(crate) async fn submit_invoice(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
    Json(payload): Json<SubmitInvoiceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let invoice_id = InvoiceId(id);
    let outcome = services
        .submission
        .submit(&invoice_id, payload.document)
        .await?;
    transition_response(&services, &invoice_id, outcome)
}

pub(crate) async fn send_invoice(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let invoice_id = InvoiceId(id);
    let outcome = services.submission.send(&invoice_id).await?;
    transition_response(&services, &invoice_id, outcome)
}

fn transition_response(
    services: &Services,
    invoice_id: &InvoiceId,
    outcome: TransitionOutcome,
) -> Result<Json<serde_json::Value>, ApiError> {
    let invoice = services
        .invoices
        .fetch(invoice_id)?
        .ok_or_else(|| ApiError::not_found("invoice not found"))?;

    let outcome = match outcome {
        TransitionOutcome::Accepted { status } => {
            json!({ "outcome": "accepted", "status": status.label() })
        }
        TransitionOutcome::Ignored(reason) => {
            json!({ "outcome": "ignored", "reason": reason.describe() })
        }
    };
    Ok(Json(json!({
        "transition": outcome,
        "invoice": invoice.status_view(),
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateMerchantRequest {
    pub(crate) merchant_id: String,
    pub(crate) registry_merchant_id: String,
    pub(crate) endpoint_id: String,
}

pub(crate) async fn create_merchant(
    State(services): State<Arc<Services>>,
    Json(payload): Json<CreateMerchantRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let merchant = Merchant::pending(
        MerchantId(payload.merchant_id),
        payload.registry_merchant_id,
        payload.endpoint_id,
    );
    let stored = services.merchants.insert(merchant)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "merchant_id": stored.id.0,
            "registration": stored.registration.label(),
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectMerchantRequest {
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
}

/// Start the OAuth flow: park the credentials behind a one-time state token
/// and hand back the registry consent URL.
pub(crate) async fn connect_merchant(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
    Json(payload): Json<ConnectMerchantRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let merchant_id = MerchantId(id);
    if services.merchants.fetch(&merchant_id)?.is_none() {
        return Err(ApiError::not_found("unknown merchant"));
    }

    let client_id = Secret::new(payload.client_id);
    let state = services.oauth_states.issue(
        merchant_id,
        client_id.clone(),
        Secret::new(payload.client_secret),
    );
    let authorize_url =
        services
            .registry
            .authorize_url(client_id.expose(), &services.redirect_uri, &state)?;

    Ok(Json(json!({
        "authorize_url": authorize_url,
        "state": state,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct OAuthCallbackParams {
    pub(crate) code: String,
    pub(crate) state: String,
}

pub(crate) async fn oauth_callback(
    State(services): State<Arc<Services>>,
    Query(params): Query<OAuthCallbackParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pending = services
        .oauth_states
        .consume(&params.state)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "unknown or expired state"))?;

    let merchant = services
        .credentials
        .connect_with_auth_code(
            &pending.merchant_id,
            pending.client_id,
            pending.client_secret,
            &params.code,
        )
        .await?;

    Ok(Json(json!({
        "merchant_id": merchant.id.0,
        "registration": merchant.registration.label(),
    })))
}

pub(crate) async fn revoke_credentials(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    services.credentials.revoke(&MerchantId(id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SweepMode {
    #[default]
    Legacy,
    Official,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RunSweepRequest {
    pub(crate) merchant_id: String,
    #[serde(default)]
    pub(crate) mode: SweepMode,
    #[serde(default)]
    pub(crate) max_age_minutes: Option<i64>,
    #[serde(default)]
    pub(crate) batch_size: Option<usize>,
    #[serde(default)]
    pub(crate) retry_attempts: Option<u32>,
}

pub(crate) async fn run_sweep(
    State(services): State<Arc<Services>>,
    Json(payload): Json<RunSweepRequest>,
) -> Result<Json<SweepSummary>, ApiError> {
    let merchant_id = MerchantId(payload.merchant_id);
    let summary = match payload.mode {
        SweepMode::Legacy => {
            let defaults = &services.sweep_defaults;
            let config = SweepConfig {
                max_age: payload
                    .max_age_minutes
                    .map(chrono::Duration::minutes)
                    .unwrap_or(defaults.max_age),
                batch_size: payload.batch_size.unwrap_or(defaults.batch_size),
                retry_attempts: payload.retry_attempts.unwrap_or(defaults.retry_attempts),
            };
            services.sweep.run_legacy(&merchant_id, &config).await?
        }
        SweepMode::Official => services.sweep.run_official(&merchant_id).await?,
    };
    Ok(Json(summary))
}
