use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use rand::distr::Alphanumeric;
use rand::Rng;

use einvoice::credentials::{Merchant, MerchantId, MerchantRepository, Secret};
use einvoice::reconciliation::{
    AuditError, AuditLog, AuditLogEntry, Invoice, InvoiceId, InvoiceRepository, RepositoryError,
};
use einvoice::webhooks::{WebhookEvent, WebhookEventRepository};

/// How long an issued OAuth state token stays redeemable.
const OAUTH_STATE_TTL_SECS: i64 = 600;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

#[derive(Default)]
pub(crate) struct InMemoryInvoiceRepository {
    records: Mutex<HashMap<InvoiceId, Invoice>>,
}

impl InvoiceRepository for InMemoryInvoiceRepository {
    fn insert(&self, invoice: Invoice) -> Result<Invoice, RepositoryError> {
        let mut guard = self.records.lock().expect("invoice mutex poisoned");
        if guard.contains_key(&invoice.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(invoice.id.clone(), invoice.clone());
        Ok(invoice)
    }

    fn fetch(&self, id: &InvoiceId) -> Result<Option<Invoice>, RepositoryError> {
        let guard = self.records.lock().expect("invoice mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn find_by_document_id(&self, document_id: &str) -> Result<Option<Invoice>, RepositoryError> {
        let guard = self.records.lock().expect("invoice mutex poisoned");
        Ok(guard
            .values()
            .find(|invoice| invoice.registry_document_id.as_deref() == Some(document_id))
            .cloned())
    }

    fn update_if_version(
        &self,
        mut invoice: Invoice,
        expected_version: u64,
    ) -> Result<bool, RepositoryError> {
        let mut guard = self.records.lock().expect("invoice mutex poisoned");
        match guard.get(&invoice.id) {
            Some(stored) if stored.version == expected_version => {
                invoice.version = expected_version + 1;
                guard.insert(invoice.id.clone(), invoice);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    fn stale_in_flight(
        &self,
        merchant_id: &MerchantId,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Invoice>, RepositoryError> {
        let guard = self.records.lock().expect("invoice mutex poisoned");
        let mut stale: Vec<Invoice> = guard
            .values()
            .filter(|invoice| {
                invoice.merchant_id == *merchant_id
                    && !invoice.status.is_terminal()
                    && invoice.observed_at < older_than
            })
            .cloned()
            .collect();
        stale.sort_by_key(|invoice| invoice.observed_at);
        stale.truncate(limit);
        Ok(stale)
    }
}

#[derive(Default)]
pub(crate) struct InMemoryMerchantRepository {
    records: Mutex<HashMap<MerchantId, Merchant>>,
}

impl MerchantRepository for InMemoryMerchantRepository {
    fn insert(&self, merchant: Merchant) -> Result<Merchant, RepositoryError> {
        let mut guard = self.records.lock().expect("merchant mutex poisoned");
        if guard.contains_key(&merchant.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(merchant.id.clone(), merchant.clone());
        Ok(merchant)
    }

    fn fetch(&self, id: &MerchantId) -> Result<Option<Merchant>, RepositoryError> {
        let guard = self.records.lock().expect("merchant mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn update(&self, merchant: Merchant) -> Result<(), RepositoryError> {
        let mut guard = self.records.lock().expect("merchant mutex poisoned");
        if guard.contains_key(&merchant.id) {
            guard.insert(merchant.id.clone(), merchant);
            Ok(())
        } else {
            Err(RepositoryError::NotFound)
        }
    }
}

#[derive(Default)]
pub(crate) struct InMemoryWebhookEventRepository {
    records: Mutex<HashMap<String, WebhookEvent>>,
}

impl WebhookEventRepository for InMemoryWebhookEventRepository {
    fn record(&self, event: WebhookEvent) -> Result<(), RepositoryError> {
        let mut guard = self.records.lock().expect("event mutex poisoned");
        if guard.contains_key(&event.event_id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(event.event_id.clone(), event);
        Ok(())
    }

    fn fetch(&self, event_id: &str) -> Result<Option<WebhookEvent>, RepositoryError> {
        let guard = self.records.lock().expect("event mutex poisoned");
        Ok(guard.get(event_id).cloned())
    }

    fn mark_processed(
        &self,
        event_id: &str,
        invoice_id: Option<&InvoiceId>,
    ) -> Result<(), RepositoryError> {
        let mut guard = self.records.lock().expect("event mutex poisoned");
        let event = guard.get_mut(event_id).ok_or(RepositoryError::NotFound)?;
        event.processed = true;
        event.processed_at = Some(Utc::now());
        event.invoice_id = invoice_id.cloned();
        event.error = None;
        Ok(())
    }

    fn record_error(&self, event_id: &str, message: &str) -> Result<(), RepositoryError> {
        let mut guard = self.records.lock().expect("event mutex poisoned");
        let event = guard.get_mut(event_id).ok_or(RepositoryError::NotFound)?;
        event.error = Some(message.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl AuditLog for InMemoryAuditLog {
    fn append(&self, entry: AuditLogEntry) -> Result<(), AuditError> {
        self.entries.lock().expect("audit mutex poisoned").push(entry);
        Ok(())
    }
}

impl InMemoryAuditLog {
    #[allow(dead_code)]
    pub(crate) fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().expect("audit mutex poisoned").clone()
    }
}

/// Credentials parked between the connect call and the OAuth callback.
pub(crate) struct PendingAuthorization {
    pub(crate) merchant_id: MerchantId,
    pub(crate) client_id: Secret,
    pub(crate) client_secret: Secret,
    issued_at: DateTime<Utc>,
}

/// One-time state tokens for the OAuth authorization flow. Each token is
/// redeemable once within the TTL; consuming it also prunes expired peers.
#[derive(Default)]
pub(crate) struct OAuthStateStore {
    pending: Mutex<HashMap<String, PendingAuthorization>>,
}

impl OAuthStateStore {
    pub(crate) fn issue(
        &self,
        merchant_id: MerchantId,
        client_id: Secret,
        client_secret: Secret,
    ) -> String {
        let state: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        self.pending.lock().expect("state mutex poisoned").insert(
            state.clone(),
            PendingAuthorization {
                merchant_id,
                client_id,
                client_secret,
                issued_at: Utc::now(),
            },
        );
        state
    }

    pub(crate) fn consume(&self, state: &str) -> Option<PendingAuthorization> {
        let mut guard = self.pending.lock().expect("state mutex poisoned");
        let cutoff = Utc::now() - Duration::seconds(OAUTH_STATE_TTL_SECS);
        guard.retain(|_, pending| pending.issued_at > cutoff);
        guard.remove(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use einvoice::reconciliation::Direction;

    fn invoice(id: &str) -> Invoice {
        Invoice::draft(
            InvoiceId(id.to_string()),
            MerchantId("m-1".to_string()),
            Direction::Outgoing,
        )
    }

    #[test]
    fn version_mismatch_loses_the_compare_and_set() {
        let repository = InMemoryInvoiceRepository::default();
        let stored = repository.insert(invoice("inv-1")).expect("insert");

        let won = repository
            .update_if_version(stored.clone(), stored.version)
            .expect("first update");
        assert!(won);

        // A second writer still holding the old version must lose.
        let lost = repository
            .update_if_version(stored.clone(), stored.version)
            .expect("second update");
        assert!(!lost);

        let current = repository
            .fetch(&stored.id)
            .expect("fetch")
            .expect("exists");
        assert_eq!(current.version, stored.version + 1);
    }

    #[test]
    fn oauth_state_is_single_use() {
        let store = OAuthStateStore::default();
        let state = store.issue(
            MerchantId("m-1".to_string()),
            Secret::new("id"),
            Secret::new("secret"),
        );

        let pending = store.consume(&state).expect("first redemption");
        assert_eq!(pending.merchant_id, MerchantId("m-1".to_string()));
        assert!(store.consume(&state).is_none(), "second redemption fails");
    }

    #[test]
    fn unknown_oauth_state_is_rejected() {
        let store = OAuthStateStore::default();
        assert!(store.consume("forged-state").is_none());
    }
}
