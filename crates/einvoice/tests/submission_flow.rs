mod common;

use chrono::Duration;
use serde_json::json;

use einvoice::credentials::MerchantRepository;
use einvoice::reconciliation::{InvoiceId, InvoiceRepository, InvoiceStatus, TransitionOutcome};
use einvoice::submission::{SubmissionError, SubmissionService};

use common::{
    connected_merchant, draft_invoice, merchant_id, Fixture, MemoryAudit, MemoryInvoices,
    MemoryMerchants, MockRegistry,
};

fn service(
    fixture: &Fixture,
) -> SubmissionService<MemoryInvoices, MemoryAudit, MemoryMerchants, MockRegistry> {
    SubmissionService::new(
        fixture.engine.clone(),
        fixture.invoices.clone(),
        fixture.merchants.clone(),
        fixture.credentials.clone(),
        fixture.registry.clone(),
    )
}

#[tokio::test]
async fn successful_submission_records_the_document_id() {
    let fixture = Fixture::new();
    fixture
        .merchants
        .insert(connected_merchant(Duration::hours(1)))
        .expect("merchant");
    let invoice = draft_invoice("inv-1", None);
    let id = invoice.id.clone();
    fixture.invoices.insert(invoice).expect("insert");

    let outcome = service(&fixture)
        .submit(&id, json!({"lines": [{"net": 100}]}))
        .await
        .expect("submit");
    assert_eq!(
        outcome,
        TransitionOutcome::Accepted {
            status: InvoiceStatus::Submitted
        }
    );

    let stored = fixture.invoices.fetch(&id).expect("fetch").expect("exists");
    assert_eq!(stored.status, InvoiceStatus::Submitted);
    assert!(stored.registry_document_id.is_some());
    assert_eq!(fixture.audit.count_action("status_transition"), 1);
}

#[tokio::test]
async fn validation_rejection_is_terminal_with_the_registry_reason() {
    let fixture = Fixture::new();
    fixture
        .merchants
        .insert(connected_merchant(Duration::hours(1)))
        .expect("merchant");
    let invoice = draft_invoice("inv-1", None);
    let id = invoice.id.clone();
    fixture.invoices.insert(invoice).expect("insert");
    fixture.registry.reject_next_submission();

    let outcome = service(&fixture)
        .submit(&id, json!({"lines": []}))
        .await
        .expect("rejection is an outcome, not an error");
    assert_eq!(
        outcome,
        TransitionOutcome::Accepted {
            status: InvoiceStatus::ValidationFailed
        }
    );

    let stored = fixture.invoices.fetch(&id).expect("fetch").expect("exists");
    assert_eq!(stored.status, InvoiceStatus::ValidationFailed);
    assert!(stored
        .rejection_reason
        .as_deref()
        .is_some_and(|reason| reason.contains("schema validation failed")));
    assert!(stored.status.is_terminal());
}

#[tokio::test]
async fn send_moves_a_submitted_invoice_to_sent() {
    let fixture = Fixture::new();
    fixture
        .merchants
        .insert(connected_merchant(Duration::hours(1)))
        .expect("merchant");
    let service = service(&fixture);
    let invoice = draft_invoice("inv-1", None);
    let id = invoice.id.clone();
    fixture.invoices.insert(invoice).expect("insert");

    service.submit(&id, json!({"lines": []})).await.expect("submit");
    let outcome = service.send(&id).await.expect("send");
    assert_eq!(
        outcome,
        TransitionOutcome::Accepted {
            status: InvoiceStatus::Sent
        }
    );
}

#[tokio::test]
async fn send_requires_a_prior_submission() {
    let fixture = Fixture::new();
    fixture
        .merchants
        .insert(connected_merchant(Duration::hours(1)))
        .expect("merchant");
    let invoice = draft_invoice("inv-1", None);
    let id = invoice.id.clone();
    fixture.invoices.insert(invoice).expect("insert");

    let err = service(&fixture).send(&id).await.expect_err("no document id");
    assert!(matches!(err, SubmissionError::NotSubmitted));
}

#[tokio::test]
async fn unknown_invoice_is_reported_as_such() {
    let fixture = Fixture::new();
    let err = service(&fixture)
        .submit(&InvoiceId("inv-missing".to_string()), json!({}))
        .await
        .expect_err("missing invoice");
    assert!(matches!(err, SubmissionError::InvoiceNotFound));
}
