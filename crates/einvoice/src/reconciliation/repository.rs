use chrono::{DateTime, Utc};

use crate::credentials::MerchantId;

use super::domain::{Invoice, InvoiceId};

/// Storage abstraction for invoices.
///
/// `update_if_version` is the atomic compare-and-set the engine relies on for
/// per-invoice mutual exclusion; implementations must perform the version
/// check and the write as one atomic step.
pub trait InvoiceRepository: Send + Sync {
    fn insert(&self, invoice: Invoice) -> Result<Invoice, RepositoryError>;
    fn fetch(&self, id: &InvoiceId) -> Result<Option<Invoice>, RepositoryError>;
    fn find_by_document_id(&self, document_id: &str) -> Result<Option<Invoice>, RepositoryError>;
    /// Write `invoice` with `version = expected_version + 1` iff the stored
    /// version still equals `expected_version`. Returns `false` when another
    /// writer got there first.
    fn update_if_version(
        &self,
        invoice: Invoice,
        expected_version: u64,
    ) -> Result<bool, RepositoryError>;
    /// Non-terminal invoices of `merchant_id` whose newest observation is
    /// older than `older_than`, capped at `limit`.
    fn stale_in_flight(
        &self,
        merchant_id: &MerchantId,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Invoice>, RepositoryError>;
}

/// Error enumeration for repository failures, shared by all entity stores.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}
