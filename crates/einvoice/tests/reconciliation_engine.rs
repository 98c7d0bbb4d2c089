mod common;

use chrono::{Duration, Utc};

use einvoice::reconciliation::{
    EngineError, IgnoreReason, InvoiceId, InvoiceRepository, InvoiceStatus, StatusPatch,
    TransitionOutcome, TransitionSource,
};

use common::{draft_invoice, Fixture};

#[test]
fn lifecycle_advances_through_ordered_observations() {
    let fixture = Fixture::new();
    let invoice = draft_invoice("inv-1", None);
    let id = invoice.id.clone();
    fixture.invoices.insert(invoice).expect("insert");

    let t0 = Utc::now();
    let t1 = t0 + Duration::minutes(5);

    let outcome = fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Submission,
            StatusPatch::new(InvoiceStatus::Submitted, t0).with_document_id("DOC-1"),
        )
        .expect("submission transition");
    assert_eq!(
        outcome,
        TransitionOutcome::Accepted {
            status: InvoiceStatus::Submitted
        }
    );

    let outcome = fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Webhook,
            StatusPatch::new(InvoiceStatus::Validated, t1),
        )
        .expect("webhook transition");
    assert_eq!(
        outcome,
        TransitionOutcome::Accepted {
            status: InvoiceStatus::Validated
        }
    );

    // A poll that raced the webhook and carries the older observation.
    let outcome = fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Poll,
            StatusPatch::new(InvoiceStatus::Submitted, t0),
        )
        .expect("stale poll");
    assert_eq!(
        outcome,
        TransitionOutcome::Ignored(IgnoreReason::StaleObservation)
    );

    let stored = fixture.invoices.fetch(&id).expect("fetch").expect("exists");
    assert_eq!(stored.status, InvoiceStatus::Validated);
    assert_eq!(stored.observed_at, t1);
    assert_eq!(stored.registry_document_id.as_deref(), Some("DOC-1"));
    assert_eq!(fixture.audit.count_action("status_transition"), 2);
}

#[test]
fn first_submission_response_bypasses_the_timestamp_gate() {
    let fixture = Fixture::new();
    let invoice = draft_invoice("inv-1", None);
    let id = invoice.id.clone();
    let created_at = invoice.observed_at;
    fixture.invoices.insert(invoice).expect("insert");

    // Registry clock behind ours: the response timestamp predates the draft.
    let outcome = fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Submission,
            StatusPatch::new(InvoiceStatus::Submitted, created_at - Duration::minutes(2)),
        )
        .expect("first submission");
    assert_eq!(
        outcome,
        TransitionOutcome::Accepted {
            status: InvoiceStatus::Submitted
        }
    );
}

#[test]
fn out_of_order_predecessor_is_ignored_after_a_jump() {
    let fixture = Fixture::new();
    let invoice = draft_invoice("inv-1", Some("DOC-1"));
    let id = invoice.id.clone();
    fixture.invoices.insert(invoice).expect("insert");

    let t0 = Utc::now();
    fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Submission,
            StatusPatch::new(InvoiceStatus::Submitted, t0),
        )
        .expect("submit");

    // Sent arrives before Validated was ever observed; the jump is legal.
    fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Webhook,
            StatusPatch::new(InvoiceStatus::Sent, t0 + Duration::minutes(10)),
        )
        .expect("jump to sent");

    // The skipped Validated turns up late and must not move anything.
    let outcome = fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Poll,
            StatusPatch::new(InvoiceStatus::Validated, t0 + Duration::minutes(4)),
        )
        .expect("late validated");
    assert_eq!(
        outcome,
        TransitionOutcome::Ignored(IgnoreReason::StaleObservation)
    );

    let stored = fixture.invoices.fetch(&id).expect("fetch").expect("exists");
    assert_eq!(stored.status, InvoiceStatus::Sent);
}

#[test]
fn equal_timestamps_favor_the_more_final_status() {
    let fixture = Fixture::new();
    let invoice = draft_invoice("inv-1", Some("DOC-1"));
    let id = invoice.id.clone();
    fixture.invoices.insert(invoice).expect("insert");

    let t0 = Utc::now();
    fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Submission,
            StatusPatch::new(InvoiceStatus::Validated, t0),
        )
        .expect("validated");

    // Same timestamp, lower rank: a replay, ignored.
    let outcome = fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Poll,
            StatusPatch::new(InvoiceStatus::Submitted, t0),
        )
        .expect("replay");
    assert_eq!(
        outcome,
        TransitionOutcome::Ignored(IgnoreReason::StaleObservation)
    );

    // Same timestamp, higher rank: wins the tie.
    let outcome = fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Webhook,
            StatusPatch::new(InvoiceStatus::Sent, t0),
        )
        .expect("tie break");
    assert_eq!(
        outcome,
        TransitionOutcome::Accepted {
            status: InvoiceStatus::Sent
        }
    );
}

#[test]
fn terminal_invoices_accept_nothing_further() {
    let fixture = Fixture::new();
    let invoice = draft_invoice("inv-1", Some("DOC-1"));
    let id = invoice.id.clone();
    fixture.invoices.insert(invoice).expect("insert");

    let t0 = Utc::now();
    fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Submission,
            StatusPatch::new(InvoiceStatus::Rejected, t0),
        )
        .expect("rejected");

    let outcome = fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Webhook,
            StatusPatch::new(InvoiceStatus::Cancelled, t0 + Duration::minutes(1)),
        )
        .expect("post-terminal");
    assert_eq!(
        outcome,
        TransitionOutcome::Ignored(IgnoreReason::TerminalState {
            current: InvoiceStatus::Rejected
        })
    );
    assert_eq!(fixture.audit.count_action("status_transition"), 1);
}

#[test]
fn missing_invoice_is_an_error_not_an_ignore() {
    let fixture = Fixture::new();
    let err = fixture
        .engine
        .propose_transition(
            &InvoiceId("inv-missing".to_string()),
            TransitionSource::Poll,
            StatusPatch::new(InvoiceStatus::Validated, Utc::now()),
        )
        .expect_err("unknown invoice");
    assert!(matches!(err, EngineError::InvoiceNotFound));
}

#[test]
fn concurrent_identical_proposals_apply_exactly_once() {
    let fixture = Fixture::new();
    let invoice = draft_invoice("inv-1", Some("DOC-1"));
    let id = invoice.id.clone();
    fixture.invoices.insert(invoice).expect("insert");

    let t0 = Utc::now();
    fixture
        .engine
        .propose_transition(
            &id,
            TransitionSource::Submission,
            StatusPatch::new(InvoiceStatus::Submitted, t0),
        )
        .expect("submit");

    let t1 = t0 + Duration::minutes(3);
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = fixture.engine.clone();
                let id = id.clone();
                scope.spawn(move || {
                    engine.propose_transition(
                        &id,
                        TransitionSource::Webhook,
                        StatusPatch::new(InvoiceStatus::Validated, t1),
                    )
                })
            })
            .collect();

        let outcomes: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread").expect("proposal"))
            .collect();

        let accepted = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, TransitionOutcome::Accepted { .. }))
            .count();
        assert_eq!(accepted, 1, "exactly one delivery wins the race");
    });

    let stored = fixture.invoices.fetch(&id).expect("fetch").expect("exists");
    assert_eq!(stored.status, InvoiceStatus::Validated);
    // One audit entry for the submit, one for the single accepted validation.
    assert_eq!(fixture.audit.count_action("status_transition"), 2);
}
