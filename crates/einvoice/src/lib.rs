//! Invoice status reconciliation against a national e-invoicing registry.
//!
//! The crate keeps each invoice's lifecycle status correct and monotonic while
//! three independent channels observe it: the synchronous response to a
//! document submission, inbound registry webhooks, and a periodic polling
//! sweep. All status writes converge on the reconciliation engine; the other
//! modules exist to feed it trustworthy observations.

pub mod config;
pub mod credentials;
pub mod error;
pub mod polling;
pub mod reconciliation;
pub mod registry;
pub mod submission;
pub mod telemetry;
pub mod webhooks;
