use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, StatusCode, Url};

use crate::config::RegistryConfig;

use super::api::{
    DocumentSnapshot, DocumentUpdatesPage, RegistryApi, RegistryError, SubmitDocumentRequest,
    TokenGrant,
};
use super::backoff::BackoffPolicy;

/// Registry client over HTTP. Every call carries the configured timeout and
/// goes through the shared backoff policy; transient transport failures, 5xx
/// responses, and 429s are retried, 4xx validation failures never are.
pub struct HttpRegistryClient {
    http: reqwest::Client,
    base_url: String,
    policy: BackoffPolicy,
}

impl HttpRegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|err| RegistryError::Transient(err.to_string()))?;

        let policy = BackoffPolicy {
            base_delay: config.retry_base_delay,
            ..BackoffPolicy::default()
        }
        .with_max_attempts(config.retry_max_attempts);

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            policy,
        })
    }

    /// URL the user is redirected to for the registry's OAuth consent page.
    pub fn authorize_url(
        &self,
        client_id: &str,
        redirect_uri: &str,
        state: &str,
    ) -> Result<String, RegistryError> {
        let mut url = Url::parse(&format!("{}/connect/authorize", self.base_url))
            .map_err(|err| RegistryError::Decode(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("state", state);
        Ok(url.into())
    }

    async fn request_value(
        &self,
        method: Method,
        path: String,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, RegistryError> {
        self.policy
            .run(
                || self.try_request_value(method.clone(), path.clone(), token, body.clone()),
                RegistryError::is_transient,
            )
            .await
    }

    async fn try_request_value(
        &self,
        method: Method,
        path: String,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, RegistryError> {
        let response = self.send(method, path, token, body).await?;
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| RegistryError::Decode(err.to_string()))
    }

    async fn send(
        &self,
        method: Method,
        path: String,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, RegistryError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| RegistryError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RegistryError::Unauthorized,
            StatusCode::NOT_FOUND => RegistryError::NotFound,
            StatusCode::TOO_MANY_REQUESTS => RegistryError::RateLimited,
            status if status.is_client_error() => RegistryError::Validation {
                status: status.as_u16(),
                detail: response.text().await.unwrap_or_default(),
            },
            status => RegistryError::Transient(format!("registry returned {status}")),
        })
    }

    async fn token_call(&self, body: serde_json::Value) -> Result<TokenGrant, RegistryError> {
        let value = self
            .request_value(Method::POST, "/connect/token".to_string(), None, Some(body))
            .await?;
        serde_json::from_value(value).map_err(|err| RegistryError::Decode(err.to_string()))
    }

    fn parse_updates_page(value: serde_json::Value) -> Result<DocumentUpdatesPage, RegistryError> {
        let cursor = value
            .get("cursor")
            .and_then(|v| v.as_str())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| RegistryError::Decode("missing cursor".to_string()))?;
        let updates = value
            .get("updates")
            .and_then(|v| v.as_array())
            .ok_or_else(|| RegistryError::Decode("missing updates".to_string()))?
            .iter()
            .cloned()
            .map(DocumentSnapshot::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DocumentUpdatesPage { updates, cursor })
    }
}

#[async_trait]
impl RegistryApi for HttpRegistryClient {
    async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
    ) -> Result<TokenGrant, RegistryError> {
        self.token_call(serde_json::json!({
            "grant_type": "authorization_code",
            "code": code,
            "client_id": client_id,
            "client_secret": client_secret,
        }))
        .await
    }

    async fn refresh_token(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, RegistryError> {
        self.token_call(serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": client_id,
            "client_secret": client_secret,
        }))
        .await
    }

    async fn submit_document(
        &self,
        token: &str,
        request: SubmitDocumentRequest,
    ) -> Result<DocumentSnapshot, RegistryError> {
        let body = serde_json::to_value(&request)
            .map_err(|err| RegistryError::Decode(err.to_string()))?;
        let value = self
            .request_value(
                Method::POST,
                "/api/v1/documents".to_string(),
                Some(token),
                Some(body),
            )
            .await?;
        DocumentSnapshot::from_value(value)
    }

    async fn send_document(
        &self,
        token: &str,
        document_id: &str,
    ) -> Result<DocumentSnapshot, RegistryError> {
        let value = self
            .request_value(
                Method::POST,
                format!("/api/v1/documents/{document_id}/send"),
                Some(token),
                None,
            )
            .await?;
        DocumentSnapshot::from_value(value)
    }

    async fn fetch_document(
        &self,
        token: &str,
        document_id: &str,
    ) -> Result<DocumentSnapshot, RegistryError> {
        let value = self
            .request_value(
                Method::GET,
                format!("/api/v1/documents/{document_id}"),
                Some(token),
                None,
            )
            .await?;
        DocumentSnapshot::from_value(value)
    }

    async fn list_document_updates(
        &self,
        token: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<DocumentUpdatesPage, RegistryError> {
        let path = match since {
            Some(since) => format!(
                "/api/v1/documents/updates?since={}",
                since.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            None => "/api/v1/documents/updates".to_string(),
        };
        let value = self.request_value(Method::GET, path, Some(token), None).await?;
        Self::parse_updates_page(value)
    }

    async fn fetch_document_pdf(
        &self,
        token: &str,
        document_id: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let path = format!("/api/v1/documents/{document_id}/pdf");
        self.policy
            .run(
                || async {
                    let response = self
                        .send(Method::GET, path.clone(), Some(token), None)
                        .await?;
                    response
                        .bytes()
                        .await
                        .map(|bytes| bytes.to_vec())
                        .map_err(|err| RegistryError::Decode(err.to_string()))
                },
                RegistryError::is_transient,
            )
            .await
    }
}
