use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::audit::{Actor, AuditError, AuditLog, AuditLogEntry};
use super::domain::{Invoice, InvoiceId, InvoiceStatus, StatusPatch, TransitionSource};
use super::repository::{InvoiceRepository, RepositoryError};

/// Re-reads under CAS contention before the proposal is surfaced as an error
/// for the caller to retry whole.
const CAS_ATTEMPTS: u32 = 5;

/// The single authority over invoice status writes.
///
/// Every channel (submission response, webhook, polling sweep) funnels its
/// observation through [`propose_transition`]; nothing else writes status.
/// Serialization is per invoice via the repository's version compare-and-set,
/// so throughput across different invoices is unaffected.
///
/// [`propose_transition`]: ReconciliationEngine::propose_transition
pub struct ReconciliationEngine<R, L> {
    invoices: Arc<R>,
    audit: Arc<L>,
}

/// Result of a proposed status update. `Ignored` is a normal outcome, not an
/// error; stale and duplicate observations are expected under out-of-order
/// delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Accepted { status: InvoiceStatus },
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The observation is not newer than what the invoice already reflects.
    StaleObservation,
    /// The candidate status does not move the lifecycle forward.
    InvalidTransition {
        from: InvoiceStatus,
        to: InvoiceStatus,
    },
    /// The invoice already reached a terminal state for these channels.
    TerminalState { current: InvoiceStatus },
}

impl IgnoreReason {
    pub fn describe(&self) -> String {
        match self {
            IgnoreReason::StaleObservation => "stale observation".to_string(),
            IgnoreReason::InvalidTransition { from, to } => {
                format!("invalid transition {} -> {}", from.label(), to.label())
            }
            IgnoreReason::TerminalState { current } => {
                format!("invoice is terminal at {}", current.label())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invoice not found")]
    InvoiceNotFound,
    #[error("invoice update contention persisted across {attempts} attempts")]
    Contention { attempts: u32 },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

enum Decision {
    Apply,
    Ignore(IgnoreReason),
}

impl<R, L> ReconciliationEngine<R, L>
where
    R: InvoiceRepository,
    L: AuditLog,
{
    pub fn new(invoices: Arc<R>, audit: Arc<L>) -> Self {
        Self { invoices, audit }
    }

    /// Propose a status update observed by `source`.
    ///
    /// Loads the invoice, gates the observation on timestamp and lifecycle
    /// order, and applies the patch through the repository's version CAS.
    /// A lost CAS race re-reads and re-decides; acceptance appends exactly
    /// one audit entry tagged with the source.
    pub fn propose_transition(
        &self,
        invoice_id: &InvoiceId,
        source: TransitionSource,
        patch: StatusPatch,
    ) -> Result<TransitionOutcome, EngineError> {
        for _ in 0..CAS_ATTEMPTS {
            let invoice = self
                .invoices
                .fetch(invoice_id)?
                .ok_or(EngineError::InvoiceNotFound)?;

            match decide(&invoice, source, &patch) {
                Decision::Ignore(reason) => {
                    debug!(
                        invoice = %invoice_id.0,
                        source = source.label(),
                        candidate = patch.status.label(),
                        reason = %reason.describe(),
                        "transition ignored"
                    );
                    return Ok(TransitionOutcome::Ignored(reason));
                }
                Decision::Apply => {
                    let previous = invoice.status;
                    let expected_version = invoice.version;
                    let mut updated = invoice;
                    patch.apply_to(&mut updated);

                    if self.invoices.update_if_version(updated, expected_version)? {
                        self.audit.append(AuditLogEntry::new(
                            actor_for(source),
                            "status_transition",
                            "invoice",
                            invoice_id.0.clone(),
                            json!({
                                "from": previous.label(),
                                "to": patch.status.label(),
                                "source": source.label(),
                                "observed_at": patch.observed_at,
                                "payload": patch.raw_payload,
                            }),
                        ))?;
                        return Ok(TransitionOutcome::Accepted {
                            status: patch.status,
                        });
                    }
                    // Version moved underneath us; re-read and re-decide.
                }
            }
        }

        Err(EngineError::Contention {
            attempts: CAS_ATTEMPTS,
        })
    }
}

fn decide(invoice: &Invoice, source: TransitionSource, patch: &StatusPatch) -> Decision {
    if invoice.status.is_terminal() {
        return Decision::Ignore(IgnoreReason::TerminalState {
            current: invoice.status,
        });
    }

    // The synchronous submission response for a draft invoice is the first
    // transition and is always accepted regardless of clock skew.
    let first_submission =
        source == TransitionSource::Submission && invoice.status == InvoiceStatus::Draft;

    if !first_submission {
        if patch.observed_at < invoice.observed_at {
            return Decision::Ignore(IgnoreReason::StaleObservation);
        }
        // Equal timestamps: the more final status wins, anything else is a
        // replay from a source with an identical clock.
        if patch.observed_at == invoice.observed_at
            && patch.status.rank() <= invoice.status.rank()
        {
            return Decision::Ignore(IgnoreReason::StaleObservation);
        }
    }

    if !invoice.status.allows_transition_to(patch.status) {
        return Decision::Ignore(IgnoreReason::InvalidTransition {
            from: invoice.status,
            to: patch.status,
        });
    }

    Decision::Apply
}

fn actor_for(source: TransitionSource) -> Actor {
    match source {
        TransitionSource::Submission => Actor::System,
        TransitionSource::Webhook => Actor::Webhook,
        TransitionSource::Poll => Actor::Poll,
    }
}
