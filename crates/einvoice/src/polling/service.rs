use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::credentials::{CredentialError, CredentialStore, MerchantId, MerchantRepository};
use crate::reconciliation::{
    Actor, AuditError, AuditLog, AuditLogEntry, EngineError, InvoiceId, InvoiceRepository,
    InvoiceStatus, ReconciliationEngine, RepositoryError, StatusPatch, TransitionOutcome,
    TransitionSource,
};
use crate::registry::{BackoffPolicy, DocumentSnapshot, RegistryApi, RegistryError};

/// Per-run settings for the legacy per-invoice sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Re-poll only invoices whose newest observation is older than this.
    pub max_age: Duration,
    /// Upper bound on invoices examined, so a single run terminates in
    /// bounded time.
    pub batch_size: usize,
    /// Fetch attempts per document, transient failures only.
    pub retry_attempts: u32,
}

impl SweepConfig {
    pub fn from_defaults(defaults: &PollingConfig) -> Self {
        Self {
            max_age: Duration::minutes(defaults.max_age_minutes),
            batch_size: defaults.batch_size,
            retry_attempts: defaults.retry_attempts,
        }
    }
}

/// Outcome counts for observability; callers do not branch on these.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepSummary {
    pub processed: usize,
    pub updated: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl SweepSummary {
    fn failure(&mut self, message: String) {
        self.failed += 1;
        self.errors.push(message);
    }
}

/// Fatal sweep failures; per-invoice problems land in the summary instead.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Pull-based reconciliation pass over invoices still in flight.
pub struct PollingSweep<R, L, M, C> {
    engine: Arc<ReconciliationEngine<R, L>>,
    invoices: Arc<R>,
    merchants: Arc<M>,
    credentials: Arc<CredentialStore<M, C>>,
    registry: Arc<C>,
    audit: Arc<L>,
    backoff: BackoffPolicy,
}

impl<R, L, M, C> PollingSweep<R, L, M, C>
where
    R: InvoiceRepository,
    L: AuditLog,
    M: MerchantRepository,
    C: RegistryApi,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<ReconciliationEngine<R, L>>,
        invoices: Arc<R>,
        merchants: Arc<M>,
        credentials: Arc<CredentialStore<M, C>>,
        registry: Arc<C>,
        audit: Arc<L>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            engine,
            invoices,
            merchants,
            credentials,
            registry,
            audit,
            backoff,
        }
    }

    /// Legacy mode: re-fetch each stale in-flight invoice individually.
    ///
    /// A document-not-found answer is terminal for that invoice within the
    /// run: recorded, never retried, and the invoice status stays untouched.
    pub async fn run_legacy(
        &self,
        merchant_id: &MerchantId,
        config: &SweepConfig,
    ) -> Result<SweepSummary, SweepError> {
        let token = self.credentials.get_valid_token(merchant_id).await?;
        let cutoff = Utc::now() - config.max_age;
        let stale = self
            .invoices
            .stale_in_flight(merchant_id, cutoff, config.batch_size)?;
        let fetch_policy = self.backoff.clone().with_max_attempts(config.retry_attempts);

        let mut summary = SweepSummary::default();
        for invoice in stale {
            summary.processed += 1;

            let Some(document_id) = invoice.registry_document_id.clone() else {
                // Draft that never reached the registry; nothing to poll.
                debug!(invoice = %invoice.id.0, "skipping invoice without a registry document id");
                continue;
            };

            let fetched = fetch_policy
                .run(
                    || self.registry.fetch_document(token.expose(), &document_id),
                    RegistryError::is_transient,
                )
                .await;

            match fetched {
                Ok(snapshot) => match self.propose_snapshot(&invoice.id, snapshot) {
                    Ok(TransitionOutcome::Accepted { .. }) => summary.updated += 1,
                    Ok(TransitionOutcome::Ignored(_)) => {}
                    Err(message) => {
                        self.record_poll_failure(&invoice.id, &message)?;
                        summary.failure(format!("{}: {message}", invoice.id.0));
                    }
                },
                Err(err) => {
                    self.record_poll_failure(&invoice.id, &err.to_string())?;
                    summary.failure(format!("{}: {err}", invoice.id.0));
                }
            }
        }

        info!(
            merchant = %merchant_id.0,
            processed = summary.processed,
            updated = summary.updated,
            failed = summary.failed,
            "legacy polling sweep finished"
        );
        Ok(summary)
    }

    /// Official mode: one bulk list-updates call from the merchant's stored
    /// cursor. The cursor advances only after the whole batch is processed
    /// without fatal error; a crash or failure mid-batch causes the next run
    /// to safely reprocess already-applied (now `Ignored`) updates.
    pub async fn run_official(&self, merchant_id: &MerchantId) -> Result<SweepSummary, SweepError> {
        let merchant = self
            .merchants
            .fetch(merchant_id)?
            .ok_or(CredentialError::NotConnected)?;
        let token = self.credentials.get_valid_token(merchant_id).await?;

        let page = self
            .registry
            .list_document_updates(token.expose(), merchant.last_synced_at)
            .await?;
        let cursor = page.cursor;

        let mut summary = SweepSummary::default();
        let mut fatal = false;

        for snapshot in page.updates {
            summary.processed += 1;
            let document_id = snapshot.document_id.clone();

            let Some(invoice) = self.invoices.find_by_document_id(&document_id)? else {
                // Bulk updates only cover documents we submitted; a miss here
                // is bookkeeping drift, not a reason to stall the cursor.
                summary.failure(format!("{document_id}: no local invoice"));
                continue;
            };

            match self.propose_snapshot(&invoice.id, snapshot) {
                Ok(TransitionOutcome::Accepted { .. }) => summary.updated += 1,
                Ok(TransitionOutcome::Ignored(_)) => {}
                Err(message) => {
                    self.record_poll_failure(&invoice.id, &message)?;
                    summary.failure(format!("{}: {message}", invoice.id.0));
                    fatal = true;
                }
            }
        }

        if fatal {
            warn!(
                merchant = %merchant_id.0,
                failed = summary.failed,
                "official sweep hit fatal errors, cursor not advanced"
            );
        } else {
            // Re-fetch: a token refresh may have rewritten the merchant row
            // while the batch was running.
            let mut merchant = self
                .merchants
                .fetch(merchant_id)?
                .ok_or(CredentialError::NotConnected)?;
            merchant.last_synced_at = Some(cursor);
            self.merchants.update(merchant)?;
        }

        info!(
            merchant = %merchant_id.0,
            processed = summary.processed,
            updated = summary.updated,
            failed = summary.failed,
            cursor_advanced = !fatal,
            "official polling sweep finished"
        );
        Ok(summary)
    }

    fn propose_snapshot(
        &self,
        invoice_id: &InvoiceId,
        snapshot: DocumentSnapshot,
    ) -> Result<TransitionOutcome, String> {
        let Some(status) = InvoiceStatus::from_registry_label(&snapshot.status) else {
            return Err(format!("unknown registry status '{}'", snapshot.status));
        };

        let mut patch = StatusPatch::new(status, snapshot.status_updated_at)
            .with_registry_status(snapshot.status.clone())
            .with_document_id(snapshot.document_id.clone())
            .with_raw_payload(snapshot.raw.clone());
        if let Some(reason) = &snapshot.rejection_reason {
            patch = patch.with_rejection_reason(reason.clone());
        }

        self.engine
            .propose_transition(invoice_id, TransitionSource::Poll, patch)
            .map_err(|err| match err {
                EngineError::InvoiceNotFound => "invoice vanished mid-sweep".to_string(),
                other => other.to_string(),
            })
    }

    /// Failed attempts are not user-facing; the audit log is where they are
    /// diagnosed.
    fn record_poll_failure(
        &self,
        invoice_id: &InvoiceId,
        message: &str,
    ) -> Result<(), SweepError> {
        self.audit.append(AuditLogEntry::new(
            Actor::Poll,
            "poll_failure",
            "invoice",
            invoice_id.0.clone(),
            json!({ "error": message }),
        ))?;
        Ok(())
    }
}
