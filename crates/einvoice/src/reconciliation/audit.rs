use chrono::{DateTime, Utc};
use serde::Serialize;

/// Who or what caused an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    User,
    Webhook,
    Poll,
}

impl Actor {
    pub const fn label(self) -> &'static str {
        match self {
            Actor::System => "system",
            Actor::User => "user",
            Actor::Webhook => "webhook",
            Actor::Poll => "poll",
        }
    }
}

/// One append-only audit record. Compliance reviews and disputed
/// reconciliation outcomes are diagnosed from these, so the raw detail
/// payload travels with every entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub actor: Actor,
    pub action: String,
    pub entity_kind: &'static str,
    pub entity_id: String,
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        actor: Actor,
        action: impl Into<String>,
        entity_kind: &'static str,
        entity_id: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            actor,
            action: action.into(),
            entity_kind,
            entity_id: entity_id.into(),
            detail,
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only audit sink. No update or delete operations are exposed.
pub trait AuditLog: Send + Sync {
    fn append(&self, entry: AuditLogEntry) -> Result<(), AuditError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log unavailable: {0}")]
    Unavailable(String),
}
