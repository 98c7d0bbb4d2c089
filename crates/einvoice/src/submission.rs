//! The synchronous submission channel: pushes a document to the registry and
//! feeds the response straight into the reconciliation engine.

use std::sync::Arc;

use chrono::Utc;

use crate::credentials::{CredentialError, CredentialStore, MerchantRepository};
use crate::reconciliation::{
    EngineError, InvoiceId, InvoiceRepository, InvoiceStatus, ReconciliationEngine,
    RepositoryError, StatusPatch, TransitionOutcome, TransitionSource,
};
use crate::reconciliation::AuditLog;
use crate::registry::{DocumentSnapshot, RegistryApi, RegistryError, SubmitDocumentRequest};

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("invoice not found")]
    InvoiceNotFound,
    #[error("invoice has not been submitted to the registry yet")]
    NotSubmitted,
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Submits and sends documents, proposing the registry's synchronous answer
/// as a `Submission`-sourced transition.
pub struct SubmissionService<R, L, M, C> {
    engine: Arc<ReconciliationEngine<R, L>>,
    invoices: Arc<R>,
    merchants: Arc<M>,
    credentials: Arc<CredentialStore<M, C>>,
    registry: Arc<C>,
}

impl<R, L, M, C> SubmissionService<R, L, M, C>
where
    R: InvoiceRepository,
    L: AuditLog,
    M: MerchantRepository,
    C: RegistryApi,
{
    pub fn new(
        engine: Arc<ReconciliationEngine<R, L>>,
        invoices: Arc<R>,
        merchants: Arc<M>,
        credentials: Arc<CredentialStore<M, C>>,
        registry: Arc<C>,
    ) -> Self {
        Self {
            engine,
            invoices,
            merchants,
            credentials,
            registry,
        }
    }

    /// Submit the document body for an invoice. The first transition of a
    /// draft invoice is always accepted by the engine, so the caller sees the
    /// registry's verdict reflected immediately. A 4xx rejection is terminal:
    /// it is recorded as `ValidationFailed` with the registry's reason.
    pub async fn submit(
        &self,
        invoice_id: &InvoiceId,
        document: serde_json::Value,
    ) -> Result<TransitionOutcome, SubmissionError> {
        let invoice = self
            .invoices
            .fetch(invoice_id)?
            .ok_or(SubmissionError::InvoiceNotFound)?;
        let merchant = self
            .merchants
            .fetch(&invoice.merchant_id)?
            .ok_or(CredentialError::NotConnected)?;
        let token = self.credentials.get_valid_token(&invoice.merchant_id).await?;

        let request = SubmitDocumentRequest {
            invoice_uuid: invoice.uuid,
            endpoint_id: merchant.endpoint_id.clone(),
            document,
        };

        match self.registry.submit_document(token.expose(), request).await {
            Ok(snapshot) => Ok(self.propose_snapshot(invoice_id, snapshot)?),
            Err(RegistryError::Validation { status, detail }) => {
                let patch = StatusPatch::new(InvoiceStatus::ValidationFailed, Utc::now())
                    .with_rejection_reason(format!("registry rejected submission ({status}): {detail}"));
                Ok(self
                    .engine
                    .propose_transition(invoice_id, TransitionSource::Submission, patch)?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Ask the registry to deliver an already-submitted document to its
    /// recipient.
    pub async fn send(&self, invoice_id: &InvoiceId) -> Result<TransitionOutcome, SubmissionError> {
        let invoice = self
            .invoices
            .fetch(invoice_id)?
            .ok_or(SubmissionError::InvoiceNotFound)?;
        let document_id = invoice
            .registry_document_id
            .clone()
            .ok_or(SubmissionError::NotSubmitted)?;
        let token = self.credentials.get_valid_token(&invoice.merchant_id).await?;

        let snapshot = self
            .registry
            .send_document(token.expose(), &document_id)
            .await?;
        Ok(self.propose_snapshot(invoice_id, snapshot)?)
    }

    fn propose_snapshot(
        &self,
        invoice_id: &InvoiceId,
        snapshot: DocumentSnapshot,
    ) -> Result<TransitionOutcome, EngineError> {
        let status = InvoiceStatus::from_registry_label(&snapshot.status)
            .unwrap_or(InvoiceStatus::Submitted);

        let mut patch = StatusPatch::new(status, snapshot.status_updated_at)
            .with_registry_status(snapshot.status.clone())
            .with_document_id(snapshot.document_id.clone())
            .with_raw_payload(snapshot.raw.clone());
        if let Some(reason) = &snapshot.rejection_reason {
            patch = patch.with_rejection_reason(reason.clone());
        }

        self.engine
            .propose_transition(invoice_id, TransitionSource::Submission, patch)
    }
}
