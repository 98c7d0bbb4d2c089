use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credentials::MerchantId;

/// Identifier wrapper for locally tracked invoices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceId(pub String);

/// Lifecycle status of an invoice as seen through the registry.
///
/// The order is `Draft → Submitted → {Validated | ValidationFailed} → Sent →
/// {Accepted | Rejected} → Cancelled`. Statuses on the same branch level share
/// a rank; the reconciliation engine only ever moves rank-forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Submitted,
    Validated,
    ValidationFailed,
    Sent,
    Accepted,
    Rejected,
    Cancelled,
}

impl InvoiceStatus {
    pub const fn label(self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Submitted => "submitted",
            InvoiceStatus::Validated => "validated",
            InvoiceStatus::ValidationFailed => "validation_failed",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Accepted => "accepted",
            InvoiceStatus::Rejected => "rejected",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    /// Position in the lifecycle order; equal ranks are branch alternatives.
    pub const fn rank(self) -> u8 {
        match self {
            InvoiceStatus::Draft => 0,
            InvoiceStatus::Submitted => 1,
            InvoiceStatus::Validated | InvoiceStatus::ValidationFailed => 2,
            InvoiceStatus::Sent => 3,
            InvoiceStatus::Accepted | InvoiceStatus::Rejected => 4,
            InvoiceStatus::Cancelled => 5,
        }
    }

    /// Terminal for the submission/webhook/poll channels. Cancellation is a
    /// separate user action and not proposed through those channels.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            InvoiceStatus::ValidationFailed
                | InvoiceStatus::Accepted
                | InvoiceStatus::Rejected
                | InvoiceStatus::Cancelled
        )
    }

    /// Whether `candidate` is a valid forward transition from `self`.
    ///
    /// Out-of-order delivery means a later lifecycle state can be observed
    /// before its predecessors, so any strictly-forward rank jump from a
    /// non-terminal state is allowed (e.g. `Submitted → Sent` without an
    /// observed `Validated`).
    pub fn allows_transition_to(self, candidate: InvoiceStatus) -> bool {
        !self.is_terminal() && candidate.rank() > self.rank()
    }

    /// Map the registry's status label onto the lifecycle. Unknown labels are
    /// not mapped; callers log and skip them.
    pub fn from_registry_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "submitted" => Some(InvoiceStatus::Submitted),
            "valid" | "validated" => Some(InvoiceStatus::Validated),
            "invalid" | "validation_failed" => Some(InvoiceStatus::ValidationFailed),
            "delivered" | "sent" => Some(InvoiceStatus::Sent),
            "accepted" => Some(InvoiceStatus::Accepted),
            "rejected" => Some(InvoiceStatus::Rejected),
            "cancelled" | "canceled" => Some(InvoiceStatus::Cancelled),
            _ => None,
        }
    }
}

/// Direction of the document relative to this merchant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub const fn label(self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
        }
    }
}

/// Which channel produced a status observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionSource {
    Submission,
    Webhook,
    Poll,
}

impl TransitionSource {
    pub const fn label(self) -> &'static str {
        match self {
            TransitionSource::Submission => "submission",
            TransitionSource::Webhook => "webhook",
            TransitionSource::Poll => "poll",
        }
    }
}

/// An invoice moving through the registry lifecycle.
///
/// Mutated exclusively by the reconciliation engine; `version` backs the
/// optimistic compare-and-set in the repository so mutual exclusion holds
/// across processes, not just threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub merchant_id: MerchantId,
    /// Registry UUID assigned at creation, immutable.
    pub uuid: Uuid,
    /// Registry document id, set once on first successful submission.
    pub registry_document_id: Option<String>,
    pub direction: Direction,
    pub status: InvoiceStatus,
    /// Verbatim status label last reported by the registry.
    pub registry_status: Option<String>,
    /// Timestamp of the newest observation applied to this invoice.
    pub observed_at: DateTime<Utc>,
    /// Raw last registry response payload, kept opaque for audit purposes.
    pub raw_payload: Option<serde_json::Value>,
    pub rejection_reason: Option<String>,
    pub version: u64,
}

impl Invoice {
    pub fn draft(id: InvoiceId, merchant_id: MerchantId, direction: Direction) -> Self {
        Self {
            id,
            merchant_id,
            uuid: Uuid::new_v4(),
            registry_document_id: None,
            direction,
            status: InvoiceStatus::Draft,
            registry_status: None,
            observed_at: Utc::now(),
            raw_payload: None,
            rejection_reason: None,
            version: 0,
        }
    }

    pub fn status_view(&self) -> InvoiceStatusView {
        InvoiceStatusView {
            invoice_id: self.id.clone(),
            status: self.status.label(),
            registry_status: self.registry_status.clone(),
            direction: self.direction.label(),
            observed_at: self.observed_at,
            rejection_reason: self.rejection_reason.clone(),
        }
    }
}

/// Sanitized representation of an invoice's exposed status.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceStatusView {
    pub invoice_id: InvoiceId,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_status: Option<String>,
    pub direction: &'static str,
    pub observed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// Typed partial update applied by the reconciliation engine.
///
/// `None` fields keep the invoice's previous value; the merge lives in exactly
/// one place instead of being re-spelled at every call site.
#[derive(Debug, Clone)]
pub struct StatusPatch {
    pub status: InvoiceStatus,
    pub observed_at: DateTime<Utc>,
    pub registry_status: Option<String>,
    pub registry_document_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub raw_payload: Option<serde_json::Value>,
}

impl StatusPatch {
    pub fn new(status: InvoiceStatus, observed_at: DateTime<Utc>) -> Self {
        Self {
            status,
            observed_at,
            registry_status: None,
            registry_document_id: None,
            rejection_reason: None,
            raw_payload: None,
        }
    }

    pub fn with_registry_status(mut self, label: impl Into<String>) -> Self {
        self.registry_status = Some(label.into());
        self
    }

    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.registry_document_id = Some(document_id.into());
        self
    }

    pub fn with_rejection_reason(mut self, reason: impl Into<String>) -> Self {
        self.rejection_reason = Some(reason.into());
        self
    }

    pub fn with_raw_payload(mut self, payload: serde_json::Value) -> Self {
        self.raw_payload = Some(payload);
        self
    }

    /// Null-safe merge with the previous invoice state. The registry document
    /// id is set-once: an existing id is never overwritten.
    pub(crate) fn apply_to(&self, invoice: &mut Invoice) {
        invoice.status = self.status;
        invoice.observed_at = self.observed_at;
        if let Some(label) = &self.registry_status {
            invoice.registry_status = Some(label.clone());
        }
        if invoice.registry_document_id.is_none() {
            if let Some(document_id) = &self.registry_document_id {
                invoice.registry_document_id = Some(document_id.clone());
            }
        }
        if let Some(reason) = &self.rejection_reason {
            invoice.rejection_reason = Some(reason.clone());
        }
        if let Some(payload) = &self.raw_payload {
            invoice.raw_payload = Some(payload.clone());
        }
    }
}
