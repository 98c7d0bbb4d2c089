use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::registry::RegistryError;
use crate::telemetry::TelemetryError;

/// Top-level application error for the service binary and its HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(#[from] axum::Error),
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Credential(CredentialError::NotConnected) => StatusCode::CONFLICT,
            AppError::Credential(_) => StatusCode::BAD_GATEWAY,
            AppError::Registry(RegistryError::Validation { .. }) => StatusCode::BAD_REQUEST,
            AppError::Registry(RegistryError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Registry(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Telemetry(_) | AppError::Io(_) | AppError::Server(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
