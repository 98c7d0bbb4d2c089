//! Invoice status reconciliation: lifecycle model, audit trail, and the
//! engine that serializes every status write.

pub mod audit;
pub mod domain;
pub mod engine;
pub mod repository;

pub use audit::{Actor, AuditError, AuditLog, AuditLogEntry};
pub use domain::{
    Direction, Invoice, InvoiceId, InvoiceStatus, InvoiceStatusView, StatusPatch, TransitionSource,
};
pub use engine::{EngineError, IgnoreReason, ReconciliationEngine, TransitionOutcome};
pub use repository::{InvoiceRepository, RepositoryError};
