use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::reconciliation::RepositoryError;
use crate::registry::{RegistryApi, TokenGrant};

use super::domain::{Merchant, MerchantId, MerchantRepository, RegistrationStatus, Secret, TokenSet};

/// Refresh ahead of expiry by this much so in-flight requests never carry a
/// token that dies mid-call.
const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

/// Serves per-merchant OAuth tokens with a keyed in-memory cache and
/// per-merchant single-flight refresh.
///
/// Concurrent callers for the same merchant block on the in-flight refresh
/// instead of issuing duplicates, which would invalidate each other's refresh
/// tokens upstream. Tokens live in the cache only until their expiry margin;
/// [`evict`](CredentialStore::evict) and [`revoke`](CredentialStore::revoke)
/// drop them explicitly.
pub struct CredentialStore<M, C> {
    merchants: Arc<M>,
    registry: Arc<C>,
    cache: Mutex<HashMap<MerchantId, TokenSet>>,
    refresh_locks: tokio::sync::Mutex<HashMap<MerchantId, Arc<tokio::sync::Mutex<()>>>>,
    margin: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("merchant is not connected to the registry")]
    NotConnected,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("authorization code exchange failed: {0}")]
    ExchangeFailed(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl<M, C> CredentialStore<M, C>
where
    M: MerchantRepository,
    C: RegistryApi,
{
    pub fn new(merchants: Arc<M>, registry: Arc<C>) -> Self {
        Self::with_margin(merchants, registry, Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS))
    }

    pub fn with_margin(merchants: Arc<M>, registry: Arc<C>, margin: Duration) -> Self {
        Self {
            merchants,
            registry,
            cache: Mutex::new(HashMap::new()),
            refresh_locks: tokio::sync::Mutex::new(HashMap::new()),
            margin,
        }
    }

    /// Return an access token with at least the refresh margin of validity
    /// left, refreshing through the registry when necessary.
    pub async fn get_valid_token(&self, merchant_id: &MerchantId) -> Result<Secret, CredentialError> {
        if let Some(token) = self.cached(merchant_id) {
            return Ok(token);
        }

        let lock = self.refresh_lock(merchant_id).await;
        let _guard = lock.lock().await;

        // Another caller may have completed the refresh while we waited.
        if let Some(token) = self.cached(merchant_id) {
            return Ok(token);
        }

        self.refresh(merchant_id).await
    }

    /// Exchange an authorization code for tokens and persist the connection.
    pub async fn connect_with_auth_code(
        &self,
        merchant_id: &MerchantId,
        client_id: Secret,
        client_secret: Secret,
        code: &str,
    ) -> Result<Merchant, CredentialError> {
        let mut merchant = self
            .merchants
            .fetch(merchant_id)?
            .ok_or(CredentialError::NotConnected)?;

        let grant = self
            .registry
            .exchange_code(client_id.expose(), client_secret.expose(), code)
            .await
            .map_err(|err| CredentialError::ExchangeFailed(err.to_string()))?;

        let token = token_set_from_grant(grant);
        merchant.client_id = Some(client_id);
        merchant.client_secret = Some(client_secret);
        merchant.token = Some(token.clone());
        merchant.active = true;
        merchant.registration = RegistrationStatus::Active;
        self.merchants.update(merchant.clone())?;
        self.cache_token(merchant_id, token);

        info!(merchant = %merchant_id.0, "merchant connected to registry");
        Ok(merchant)
    }

    /// Persist a credential set obtained out of band.
    pub fn store_credentials(
        &self,
        merchant_id: &MerchantId,
        client_id: Secret,
        client_secret: Secret,
        tokens: TokenSet,
    ) -> Result<(), CredentialError> {
        let mut merchant = self
            .merchants
            .fetch(merchant_id)?
            .ok_or(CredentialError::NotConnected)?;
        merchant.client_id = Some(client_id);
        merchant.client_secret = Some(client_secret);
        merchant.token = Some(tokens.clone());
        merchant.active = true;
        merchant.registration = RegistrationStatus::Active;
        self.merchants.update(merchant)?;
        self.cache_token(merchant_id, tokens);
        Ok(())
    }

    /// Disconnect the merchant: clear every secret field and deactivate.
    pub fn revoke(&self, merchant_id: &MerchantId) -> Result<(), CredentialError> {
        let mut merchant = self
            .merchants
            .fetch(merchant_id)?
            .ok_or(CredentialError::NotConnected)?;
        merchant.client_id = None;
        merchant.client_secret = None;
        merchant.token = None;
        merchant.active = false;
        merchant.registration = RegistrationStatus::Pending;
        self.merchants.update(merchant)?;
        self.evict(merchant_id);
        info!(merchant = %merchant_id.0, "merchant credentials revoked");
        Ok(())
    }

    /// Drop the cached token for a merchant without touching persisted state.
    pub fn evict(&self, merchant_id: &MerchantId) {
        self.cache
            .lock()
            .expect("credential cache mutex poisoned")
            .remove(merchant_id);
    }

    fn cached(&self, merchant_id: &MerchantId) -> Option<Secret> {
        let cache = self.cache.lock().expect("credential cache mutex poisoned");
        let token = cache.get(merchant_id)?;
        if token.expires_within(self.margin, Utc::now()) {
            return None;
        }
        Some(token.access_token.clone())
    }

    fn cache_token(&self, merchant_id: &MerchantId, token: TokenSet) {
        self.cache
            .lock()
            .expect("credential cache mutex poisoned")
            .insert(merchant_id.clone(), token);
    }

    async fn refresh_lock(&self, merchant_id: &MerchantId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(merchant_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn refresh(&self, merchant_id: &MerchantId) -> Result<Secret, CredentialError> {
        let mut merchant = self
            .merchants
            .fetch(merchant_id)?
            .ok_or(CredentialError::NotConnected)?;

        if !merchant.active || merchant.registration != RegistrationStatus::Active {
            return Err(CredentialError::NotConnected);
        }

        let (client_id, client_secret) = match (&merchant.client_id, &merchant.client_secret) {
            (Some(id), Some(secret)) => (id.clone(), secret.clone()),
            _ => return Err(CredentialError::NotConnected),
        };
        let current = merchant.token.clone().ok_or(CredentialError::NotConnected)?;

        if !current.expires_within(self.margin, Utc::now()) {
            // Persisted token is still good; only the cache was cold.
            self.cache_token(merchant_id, current.clone());
            return Ok(current.access_token);
        }

        match self
            .registry
            .refresh_token(
                client_id.expose(),
                client_secret.expose(),
                current.refresh_token.expose(),
            )
            .await
        {
            Ok(grant) => {
                let token = token_set_from_grant(grant);
                merchant.token = Some(token.clone());
                self.merchants.update(merchant)?;
                self.cache_token(merchant_id, token.clone());
                Ok(token.access_token)
            }
            Err(err) if err.is_transient() => {
                // The registry was unreachable, not the credentials bad; keep
                // the merchant connected so a later caller can retry.
                warn!(merchant = %merchant_id.0, error = %err, "token refresh failed transiently");
                Err(CredentialError::RefreshFailed(err.to_string()))
            }
            Err(err) => {
                warn!(
                    merchant = %merchant_id.0,
                    error = %err,
                    "refresh token rejected, suspending merchant"
                );
                merchant.token = None;
                merchant.registration = RegistrationStatus::Suspended;
                self.merchants.update(merchant)?;
                self.evict(merchant_id);
                Err(CredentialError::RefreshFailed(err.to_string()))
            }
        }
    }
}

fn token_set_from_grant(grant: TokenGrant) -> TokenSet {
    TokenSet {
        access_token: Secret::new(grant.access_token),
        refresh_token: Secret::new(grant.refresh_token),
        expires_at: Utc::now() + Duration::seconds(grant.expires_in_secs),
    }
}

