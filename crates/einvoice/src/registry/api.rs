use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token pair returned by the registry's OAuth endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(rename = "expires_in")]
    pub expires_in_secs: i64,
}

/// Opaque document body plus addressing for a submission call. Rendering the
/// body is out of scope; callers hand it over fully formed.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitDocumentRequest {
    pub invoice_uuid: Uuid,
    pub endpoint_id: String,
    pub document: serde_json::Value,
}

/// The registry's view of one document at a point in time.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub document_id: String,
    pub uuid: Option<String>,
    /// Verbatim registry status label.
    pub status: String,
    pub status_updated_at: DateTime<Utc>,
    pub rejection_reason: Option<String>,
    /// The full response body, preserved for the audit trail.
    pub raw: serde_json::Value,
}

impl DocumentSnapshot {
    /// Parse a registry document payload, keeping the raw body alongside the
    /// extracted fields.
    pub fn from_value(value: serde_json::Value) -> Result<Self, RegistryError> {
        let document_id = value
            .get("document_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RegistryError::Decode("missing document_id".to_string()))?
            .to_string();
        let status = value
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RegistryError::Decode("missing status".to_string()))?
            .to_string();
        let status_updated_at = value
            .get("status_updated_at")
            .or_else(|| value.get("updated_at"))
            .and_then(|v| v.as_str())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| RegistryError::Decode("missing status_updated_at".to_string()))?;
        let uuid = value
            .get("uuid")
            .and_then(|v| v.as_str())
            .map(ToString::to_string);
        let rejection_reason = value
            .get("rejection_reason")
            .and_then(|v| v.as_str())
            .map(ToString::to_string);

        Ok(Self {
            document_id,
            uuid,
            status,
            status_updated_at,
            rejection_reason,
            raw: value,
        })
    }
}

/// One page of the official bulk polling endpoint.
#[derive(Debug, Clone)]
pub struct DocumentUpdatesPage {
    pub updates: Vec<DocumentSnapshot>,
    /// Server-side cursor to persist once the page is fully applied.
    pub cursor: DateTime<Utc>,
}

/// Failure taxonomy for registry calls. Only `Transient` and `RateLimited`
/// are retried; validation failures surface immediately as terminal.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("transient registry failure: {0}")]
    Transient(String),
    #[error("registry rate limited the request")]
    RateLimited,
    #[error("registry rejected the credentials")]
    Unauthorized,
    #[error("registry rejected the request ({status}): {detail}")]
    Validation { status: u16, detail: String },
    #[error("document not found in registry")]
    NotFound,
    #[error("unexpected registry payload: {0}")]
    Decode(String),
}

impl RegistryError {
    /// Shared retry predicate for the backoff policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transient(_) | RegistryError::RateLimited)
    }
}

/// Thin client surface over the registry API. Implementations apply the
/// shared backoff policy uniformly; callers never retry non-transient
/// failures themselves.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
    ) -> Result<TokenGrant, RegistryError>;

    async fn refresh_token(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, RegistryError>;

    async fn submit_document(
        &self,
        token: &str,
        request: SubmitDocumentRequest,
    ) -> Result<DocumentSnapshot, RegistryError>;

    async fn send_document(
        &self,
        token: &str,
        document_id: &str,
    ) -> Result<DocumentSnapshot, RegistryError>;

    async fn fetch_document(
        &self,
        token: &str,
        document_id: &str,
    ) -> Result<DocumentSnapshot, RegistryError>;

    async fn list_document_updates(
        &self,
        token: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<DocumentUpdatesPage, RegistryError>;

    async fn fetch_document_pdf(
        &self,
        token: &str,
        document_id: &str,
    ) -> Result<Vec<u8>, RegistryError>;
}
