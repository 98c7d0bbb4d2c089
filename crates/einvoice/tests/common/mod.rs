#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use einvoice::credentials::{
    CredentialStore, Merchant, MerchantId, MerchantRepository, RegistrationStatus, Secret, TokenSet,
};
use einvoice::reconciliation::{
    AuditError, AuditLog, AuditLogEntry, Direction, Invoice, InvoiceId, InvoiceRepository,
    ReconciliationEngine, RepositoryError,
};
use einvoice::registry::{
    DocumentSnapshot, DocumentUpdatesPage, RegistryApi, RegistryError, SubmitDocumentRequest,
    TokenGrant,
};
use einvoice::webhooks::{WebhookEvent, WebhookEventRepository};

#[derive(Default)]
pub struct MemoryInvoices {
    records: Mutex<HashMap<InvoiceId, Invoice>>,
    pub fail_next_update: AtomicBool,
}

impl InvoiceRepository for MemoryInvoices {
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
        if self.fail_next_update.swap(false, Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("injected failure".to_string()));
        }
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
pub struct MemoryMerchants {
    records: Mutex<HashMap<MerchantId, Merchant>>,
}

impl MerchantRepository for MemoryMerchants {
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
pub struct MemoryEvents {
    records: Mutex<HashMap<String, WebhookEvent>>,
}

impl MemoryEvents {
    pub fn get(&self, event_id: &str) -> Option<WebhookEvent> {
        self.records
            .lock()
            .expect("event mutex poisoned")
            .get(event_id)
            .cloned()
    }
}

impl WebhookEventRepository for MemoryEvents {
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
pub struct MemoryAudit {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl MemoryAudit {
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().expect("audit mutex poisoned").clone()
    }

    pub fn count_action(&self, action: &str) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.action == action)
            .count()
    }
}

impl AuditLog for MemoryAudit {
    fn append(&self, entry: AuditLogEntry) -> Result<(), AuditError> {
        self.entries.lock().expect("audit mutex poisoned").push(entry);
        Ok(())
    }
}

/// Scripted registry double. Documents and update pages are seeded by the
/// test; transient failure countdowns exercise the retry paths.
#[derive(Default)]
pub struct MockRegistry {
    pub refresh_calls: AtomicUsize,
    pub fail_refresh: AtomicBool,
    pub fail_refresh_transiently: AtomicBool,
    pub refresh_delay_ms: u64,
    pub exchange_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    documents: Mutex<HashMap<String, DocumentSnapshot>>,
    transient_failures: Mutex<HashMap<String, u32>>,
    updates_page: Mutex<Option<DocumentUpdatesPage>>,
    reject_submission: AtomicBool,
}

impl MockRegistry {
    /// A registry whose refresh call takes `ms` to answer, long enough for
    /// concurrent callers to pile up on the single-flight lock.
    pub fn with_refresh_delay(ms: u64) -> Self {
        Self {
            refresh_delay_ms: ms,
            ..Self::default()
        }
    }

    pub fn seed_document(&self, snapshot: DocumentSnapshot) {
        self.documents
            .lock()
            .expect("document mutex poisoned")
            .insert(snapshot.document_id.clone(), snapshot);
    }

    pub fn fail_transiently(&self, document_id: &str, times: u32) {
        self.transient_failures
            .lock()
            .expect("failure mutex poisoned")
            .insert(document_id.to_string(), times);
    }

    pub fn seed_updates(&self, page: DocumentUpdatesPage) {
        *self.updates_page.lock().expect("updates mutex poisoned") = Some(page);
    }

    pub fn reject_next_submission(&self) {
        self.reject_submission.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryApi for MockRegistry {
    async fn exchange_code(
        &self,
        _client_id: &str,
        _client_secret: &str,
        _code: &str,
    ) -> Result<TokenGrant, RegistryError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        Ok(token_grant("exchanged"))
    }

    async fn refresh_token(
        &self,
        _client_id: &str,
        _client_secret: &str,
        _refresh_token: &str,
    ) -> Result<TokenGrant, RegistryError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.refresh_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.refresh_delay_ms)).await;
        }
        if self.fail_refresh_transiently.load(Ordering::SeqCst) {
            return Err(RegistryError::Transient("registry unreachable".to_string()));
        }
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(RegistryError::Unauthorized);
        }
        Ok(token_grant("refreshed"))
    }

    async fn submit_document(
        &self,
        _token: &str,
        request: SubmitDocumentRequest,
    ) -> Result<DocumentSnapshot, RegistryError> {
        if self.reject_submission.swap(false, Ordering::SeqCst) {
            return Err(RegistryError::Validation {
                status: 422,
                detail: "schema validation failed".to_string(),
            });
        }
        Ok(snapshot(
            &format!("DOC-{}", request.invoice_uuid.simple()),
            "Submitted",
            Utc::now(),
        ))
    }

    async fn send_document(
        &self,
        _token: &str,
        document_id: &str,
    ) -> Result<DocumentSnapshot, RegistryError> {
        Ok(snapshot(document_id, "Delivered", Utc::now()))
    }

    async fn fetch_document(
        &self,
        _token: &str,
        document_id: &str,
    ) -> Result<DocumentSnapshot, RegistryError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self
                .transient_failures
                .lock()
                .expect("failure mutex poisoned");
            if let Some(remaining) = failures.get_mut(document_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RegistryError::Transient("connection reset".to_string()));
                }
            }
        }
        self.documents
            .lock()
            .expect("document mutex poisoned")
            .get(document_id)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    async fn list_document_updates(
        &self,
        _token: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<DocumentUpdatesPage, RegistryError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.updates_page
            .lock()
            .expect("updates mutex poisoned")
            .clone()
            .ok_or_else(|| RegistryError::Transient("no page seeded".to_string()))
    }

    async fn fetch_document_pdf(
        &self,
        _token: &str,
        _document_id: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        Ok(Vec::new())
    }
}

pub fn token_grant(prefix: &str) -> TokenGrant {
    TokenGrant {
        access_token: format!("{prefix}-access"),
        refresh_token: format!("{prefix}-refresh"),
        expires_in_secs: 3600,
    }
}

pub fn snapshot(document_id: &str, status: &str, at: DateTime<Utc>) -> DocumentSnapshot {
    DocumentSnapshot {
        document_id: document_id.to_string(),
        uuid: None,
        status: status.to_string(),
        status_updated_at: at,
        rejection_reason: None,
        raw: serde_json::json!({
            "document_id": document_id,
            "status": status,
        }),
    }
}

pub fn merchant_id() -> MerchantId {
    MerchantId("merchant-1".to_string())
}

/// A merchant with valid credentials and a token expiring in `expires_in`.
pub fn connected_merchant(expires_in: Duration) -> Merchant {
    let mut merchant = Merchant::pending(merchant_id(), "REG-1", "EP-1");
    merchant.client_id = Some(Secret::new("client-id"));
    merchant.client_secret = Some(Secret::new("client-secret"));
    merchant.token = Some(TokenSet {
        access_token: Secret::new("stored-access"),
        refresh_token: Secret::new("stored-refresh"),
        expires_at: Utc::now() + expires_in,
    });
    merchant.active = true;
    merchant.registration = RegistrationStatus::Active;
    merchant
}

pub fn draft_invoice(id: &str, document_id: Option<&str>) -> Invoice {
    let mut invoice = Invoice::draft(
        InvoiceId(id.to_string()),
        merchant_id(),
        Direction::Outgoing,
    );
    invoice.registry_document_id = document_id.map(ToString::to_string);
    invoice
}

pub struct Fixture {
    pub invoices: Arc<MemoryInvoices>,
    pub merchants: Arc<MemoryMerchants>,
    pub events: Arc<MemoryEvents>,
    pub audit: Arc<MemoryAudit>,
    pub registry: Arc<MockRegistry>,
    pub engine: Arc<ReconciliationEngine<MemoryInvoices, MemoryAudit>>,
    pub credentials: Arc<CredentialStore<MemoryMerchants, MockRegistry>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_registry(MockRegistry::default())
    }

    pub fn with_registry(registry: MockRegistry) -> Self {
        let invoices = Arc::new(MemoryInvoices::default());
        let merchants = Arc::new(MemoryMerchants::default());
        let events = Arc::new(MemoryEvents::default());
        let audit = Arc::new(MemoryAudit::default());
        let registry = Arc::new(registry);
        let engine = Arc::new(ReconciliationEngine::new(invoices.clone(), audit.clone()));
        let credentials = Arc::new(CredentialStore::new(merchants.clone(), registry.clone()));
        Self {
            invoices,
            merchants,
            events,
            audit,
            registry,
            engine,
            credentials,
        }
    }
}
