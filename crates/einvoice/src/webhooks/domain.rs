use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::reconciliation::{InvoiceId, InvoiceStatus, RepositoryError};

pub const EVENT_DOCUMENT_DELIVERED: &str = "DOCUMENT_DELIVERED";
pub const EVENT_DOCUMENT_STATUS_UPDATED: &str = "DOCUMENT_STATUS_UPDATED";

/// The registry's webhook envelope as delivered on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub document_id: String,
    #[serde(default)]
    pub status: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl WebhookEnvelope {
    /// Map the event onto a candidate lifecycle status. `None` means the
    /// event type (or its embedded status label) is not one we act on.
    pub fn candidate_status(&self) -> Option<InvoiceStatus> {
        match self.event_type.as_str() {
            EVENT_DOCUMENT_DELIVERED => Some(InvoiceStatus::Sent),
            EVENT_DOCUMENT_STATUS_UPDATED => self
                .status
                .as_deref()
                .and_then(InvoiceStatus::from_registry_label),
            _ => None,
        }
    }
}

/// Stored record of an inbound notification. Immutable except for the
/// processed/error bookkeeping, which is set once by ingestion.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub invoice_id: Option<InvoiceId>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn received(envelope: &WebhookEnvelope, payload: serde_json::Value) -> Self {
        Self {
            event_id: envelope.event_id.clone(),
            event_type: envelope.event_type.clone(),
            payload,
            invoice_id: None,
            processed: false,
            processed_at: None,
            error: None,
            received_at: Utc::now(),
        }
    }
}

/// Storage abstraction for webhook events, keyed by the registry event id.
pub trait WebhookEventRepository: Send + Sync {
    /// Record a newly received event; replaces nothing if the id exists.
    fn record(&self, event: WebhookEvent) -> Result<(), RepositoryError>;
    fn fetch(&self, event_id: &str) -> Result<Option<WebhookEvent>, RepositoryError>;
    fn mark_processed(
        &self,
        event_id: &str,
        invoice_id: Option<&InvoiceId>,
    ) -> Result<(), RepositoryError>;
    /// Leave the event unprocessed with a failure note so a registry retry
    /// can replay it.
    fn record_error(&self, event_id: &str, message: &str) -> Result<(), RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event_type: &str, status: Option<&str>) -> WebhookEnvelope {
        WebhookEnvelope {
            event_id: "evt-1".to_string(),
            event_type: event_type.to_string(),
            document_id: "DOC-1".to_string(),
            status: status.map(ToString::to_string),
            timestamp: Utc::now(),
            merchant_id: None,
            reason: None,
        }
    }

    #[test]
    fn delivered_event_maps_to_sent() {
        assert_eq!(
            envelope(EVENT_DOCUMENT_DELIVERED, None).candidate_status(),
            Some(InvoiceStatus::Sent)
        );
    }

    #[test]
    fn status_update_uses_embedded_label() {
        assert_eq!(
            envelope(EVENT_DOCUMENT_STATUS_UPDATED, Some("Rejected")).candidate_status(),
            Some(InvoiceStatus::Rejected)
        );
        assert_eq!(
            envelope(EVENT_DOCUMENT_STATUS_UPDATED, Some("archived")).candidate_status(),
            None
        );
        assert_eq!(
            envelope(EVENT_DOCUMENT_STATUS_UPDATED, None).candidate_status(),
            None
        );
    }

    #[test]
    fn unknown_event_types_map_to_nothing() {
        assert_eq!(envelope("DOCUMENT_ARCHIVED", None).candidate_status(), None);
    }
}
