use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::credentials::MerchantId;
use crate::reconciliation::{
    Actor, AuditError, AuditLog, AuditLogEntry, Direction, EngineError, Invoice, InvoiceId,
    InvoiceRepository, ReconciliationEngine, RepositoryError, StatusPatch, TransitionSource,
};

use super::domain::{WebhookEnvelope, WebhookEvent, WebhookEventRepository};
use super::signature::{self, SignatureError};

/// Disposition of one inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Verifies, deduplicates, and applies inbound registry notifications.
///
/// This is the only path allowed to materialize a brand-new `Incoming`
/// invoice: events can reference documents the local system has never seen.
pub struct WebhookIngestion<R, L, W> {
    engine: Arc<ReconciliationEngine<R, L>>,
    invoices: Arc<R>,
    events: Arc<W>,
    audit: Arc<L>,
    secret: String,
    /// Merchant attributed to materialized invoices when the envelope does
    /// not carry a merchant id (single-tenant deployments).
    fallback_merchant: MerchantId,
}

impl<R, L, W> WebhookIngestion<R, L, W>
where
    R: InvoiceRepository,
    L: AuditLog,
    W: WebhookEventRepository,
{
    pub fn new(
        engine: Arc<ReconciliationEngine<R, L>>,
        invoices: Arc<R>,
        events: Arc<W>,
        audit: Arc<L>,
        secret: impl Into<String>,
        fallback_merchant: MerchantId,
    ) -> Self {
        Self {
            engine,
            invoices,
            events,
            audit,
            secret: secret.into(),
            fallback_merchant,
        }
    }

    /// Process one raw delivery. Transient failures leave the stored event
    /// unprocessed with an error note so the registry's retry can replay it;
    /// everything else marks the event processed exactly once.
    pub fn handle(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<IngestOutcome, WebhookError> {
        self.handle_at(payload, signature_header, Utc::now())
    }

    /// Same as [`handle`](Self::handle) with an injectable clock for the
    /// signature replay window.
    pub fn handle_at(
        &self,
        payload: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, WebhookError> {
        signature::verify(&self.secret, payload, signature_header, now)?;

        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|err| WebhookError::Malformed(err.to_string()))?;
        let envelope: WebhookEnvelope = serde_json::from_value(value.clone())
            .map_err(|err| WebhookError::Malformed(err.to_string()))?;

        match self.events.fetch(&envelope.event_id)? {
            Some(existing) if existing.processed => {
                self.audit.append(AuditLogEntry::new(
                    Actor::Webhook,
                    "duplicate-ignored",
                    "webhook_event",
                    envelope.event_id.clone(),
                    json!({ "event_type": envelope.event_type }),
                ))?;
                debug!(event = %envelope.event_id, "duplicate webhook delivery ignored");
                return Ok(IngestOutcome::Duplicate);
            }
            Some(_) => {
                // A previously failed event being replayed; take another run
                // at it without re-recording the receipt.
            }
            None => {
                self.events
                    .record(WebhookEvent::received(&envelope, value.clone()))?;
            }
        }

        let invoice = self.resolve_invoice(&envelope)?;

        let Some(status) = envelope.candidate_status() else {
            info!(
                event = %envelope.event_id,
                event_type = %envelope.event_type,
                "unhandled registry event type"
            );
            self.events
                .mark_processed(&envelope.event_id, Some(&invoice.id))?;
            return Ok(IngestOutcome::Accepted);
        };

        let mut patch = StatusPatch::new(status, envelope.timestamp)
            .with_document_id(envelope.document_id.clone())
            .with_raw_payload(value);
        if let Some(label) = &envelope.status {
            patch = patch.with_registry_status(label.clone());
        }
        if let Some(reason) = &envelope.reason {
            patch = patch.with_rejection_reason(reason.clone());
        }

        match self
            .engine
            .propose_transition(&invoice.id, TransitionSource::Webhook, patch)
        {
            Ok(_) => {
                // Accepted and Ignored both resolve the event; Ignored just
                // means the observation was stale, replaying it cannot help.
                self.events
                    .mark_processed(&envelope.event_id, Some(&invoice.id))?;
                Ok(IngestOutcome::Accepted)
            }
            Err(err) => {
                self.events
                    .record_error(&envelope.event_id, &err.to_string())?;
                Err(err.into())
            }
        }
    }

    /// Find the target invoice by registry document id, materializing an
    /// `Incoming` shell when the document is not yet known locally.
    fn resolve_invoice(&self, envelope: &WebhookEnvelope) -> Result<Invoice, WebhookError> {
        if let Some(invoice) = self.invoices.find_by_document_id(&envelope.document_id)? {
            return Ok(invoice);
        }

        let merchant_id = envelope
            .merchant_id
            .clone()
            .map(MerchantId)
            .unwrap_or_else(|| self.fallback_merchant.clone());

        let mut shell = Invoice::draft(
            InvoiceId(format!("inv-{}", envelope.document_id)),
            merchant_id,
            Direction::Incoming,
        );
        shell.registry_document_id = Some(envelope.document_id.clone());
        // Backdate so the event's own timestamp passes the engine's
        // strictly-newer gate.
        shell.observed_at = DateTime::<Utc>::MIN_UTC;

        match self.invoices.insert(shell.clone()) {
            Ok(invoice) => {
                self.audit.append(AuditLogEntry::new(
                    Actor::Webhook,
                    "invoice_materialized",
                    "invoice",
                    invoice.id.0.clone(),
                    json!({
                        "document_id": envelope.document_id,
                        "event_id": envelope.event_id,
                    }),
                ))?;
                Ok(invoice)
            }
            Err(RepositoryError::Conflict) => {
                // A concurrent delivery materialized it first.
                self.invoices
                    .find_by_document_id(&envelope.document_id)?
                    .ok_or(WebhookError::Repository(RepositoryError::NotFound))
            }
            Err(err) => Err(err.into()),
        }
    }
}
