use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub registry: RegistryConfig,
    pub polling: PollingConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            registry: RegistryConfig::from_env()?,
            polling: PollingConfig::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing and metrics controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Connection settings for the e-invoicing registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base URL of the registry API, without a trailing slash.
    pub base_url: String,
    /// Redirect URI registered for the OAuth2 authorization flow.
    pub redirect_uri: String,
    /// Shared secret used to authenticate inbound webhook payloads.
    pub webhook_secret: String,
    /// Per-request timeout for outbound registry calls.
    pub http_timeout: Duration,
    /// Total attempts (first call included) for retryable registry calls.
    pub retry_max_attempts: u32,
    /// Base delay for the exponential backoff between retries.
    pub retry_base_delay: Duration,
}

impl RegistryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let base_url = env::var("REGISTRY_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8081".to_string())
            .trim_end_matches('/')
            .to_string();
        let redirect_uri = env::var("REGISTRY_REDIRECT_URI")
            .unwrap_or_else(|_| "http://127.0.0.1:3000/oauth/callback".to_string());
        let webhook_secret =
            env::var("REGISTRY_WEBHOOK_SECRET").unwrap_or_else(|_| "dev-webhook-secret".to_string());
        if webhook_secret.trim().is_empty() {
            return Err(ConfigError::EmptyWebhookSecret);
        }

        let http_timeout = Duration::from_secs(parse_env_number("REGISTRY_HTTP_TIMEOUT_SECS", 15)?);
        let retry_max_attempts =
            parse_env_number::<u32>("REGISTRY_RETRY_MAX_ATTEMPTS", 3)?.max(1);
        let retry_base_delay =
            Duration::from_millis(parse_env_number("REGISTRY_RETRY_BASE_DELAY_MS", 200)?);

        Ok(Self {
            base_url,
            redirect_uri,
            webhook_secret,
            http_timeout,
            retry_max_attempts,
            retry_base_delay,
        })
    }
}

/// Defaults for the status polling sweep; callers may override per run.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Only invoices whose last observation is older than this are re-polled.
    pub max_age_minutes: i64,
    /// Upper bound on invoices examined in a single sweep run.
    pub batch_size: usize,
    /// Per-document fetch attempts during a legacy sweep.
    pub retry_attempts: u32,
}

impl PollingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            max_age_minutes: parse_env_number("POLL_MAX_AGE_MINUTES", 30)?,
            batch_size: parse_env_number("POLL_BATCH_SIZE", 50)?,
            retry_attempts: parse_env_number::<u32>("POLL_RETRY_ATTEMPTS", 3)?.max(1),
        })
    }
}

fn parse_env_number<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Copy,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { key }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { key: &'static str },
    EmptyWebhookSecret,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { key } => {
                write!(f, "{key} must be a non-negative number")
            }
            ConfigError::EmptyWebhookSecret => {
                write!(f, "REGISTRY_WEBHOOK_SECRET must not be empty")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}
