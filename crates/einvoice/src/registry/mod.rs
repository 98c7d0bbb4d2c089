//! Thin, retryable client surface over the e-invoicing registry API.

pub mod api;
pub mod backoff;
pub mod client;

pub use api::{
    DocumentSnapshot, DocumentUpdatesPage, RegistryApi, RegistryError, SubmitDocumentRequest,
    TokenGrant,
};
pub use backoff::BackoffPolicy;
pub use client::HttpRegistryClient;
