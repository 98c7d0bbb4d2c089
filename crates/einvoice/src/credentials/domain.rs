use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::reconciliation::RepositoryError;

/// Identifier wrapper for registered merchants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MerchantId(pub String);

/// An OAuth secret that must never leak through logs or serialization.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Deliberately verbose accessor so call sites reading the plaintext are
    /// easy to audit.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(redacted)")
    }
}

/// Access/refresh token pair issued by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: Secret,
    pub refresh_token: Secret,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    /// True when the access token expires within `margin` of `now`.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + margin
    }
}

/// Connection state of a merchant with the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Pending,
    Active,
    Suspended,
}

impl RegistrationStatus {
    pub const fn label(self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Active => "active",
            RegistrationStatus::Suspended => "suspended",
        }
    }
}

/// A registered business connection to the registry.
///
/// Owned exclusively by the credential store: token refresh, connect, and
/// revoke are the only mutations. At most one token pair exists at a time and
/// a revoke clears every secret field.
#[derive(Debug, Clone)]
pub struct Merchant {
    pub id: MerchantId,
    pub registry_merchant_id: String,
    pub endpoint_id: String,
    pub client_id: Option<Secret>,
    pub client_secret: Option<Secret>,
    pub token: Option<TokenSet>,
    pub active: bool,
    pub registration: RegistrationStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Merchant {
    pub fn pending(
        id: MerchantId,
        registry_merchant_id: impl Into<String>,
        endpoint_id: impl Into<String>,
    ) -> Self {
        Self {
            id,
            registry_merchant_id: registry_merchant_id.into(),
            endpoint_id: endpoint_id.into(),
            client_id: None,
            client_secret: None,
            token: None,
            active: false,
            registration: RegistrationStatus::Pending,
            last_synced_at: None,
        }
    }
}

/// Storage abstraction for merchants. Encryption of the secret columns is the
/// adapter's concern; the library guarantees redaction and revoke semantics.
pub trait MerchantRepository: Send + Sync {
    fn insert(&self, merchant: Merchant) -> Result<Merchant, RepositoryError>;
    fn fetch(&self, id: &MerchantId) -> Result<Option<Merchant>, RepositoryError>;
    fn update(&self, merchant: Merchant) -> Result<(), RepositoryError>;
}
