//! Inbound registry webhook handling: authenticity verification,
//! deduplication, event-to-status mapping, and the HTTP endpoint.

pub mod domain;
pub mod router;
pub mod service;
pub mod signature;

pub use domain::{
    WebhookEnvelope, WebhookEvent, WebhookEventRepository, EVENT_DOCUMENT_DELIVERED,
    EVENT_DOCUMENT_STATUS_UPDATED,
};
pub use router::webhook_router;
pub use service::{IngestOutcome, WebhookError, WebhookIngestion};
pub use signature::{SignatureError, SIGNATURE_HEADER};
