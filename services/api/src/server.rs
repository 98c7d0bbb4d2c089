use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use tracing::info;

use einvoice::config::AppConfig;
use einvoice::credentials::{CredentialStore, MerchantId};
use einvoice::error::AppError;
use einvoice::polling::{PollingSweep, SweepConfig};
use einvoice::reconciliation::ReconciliationEngine;
use einvoice::registry::{BackoffPolicy, HttpRegistryClient};
use einvoice::submission::SubmissionService;
use einvoice::telemetry;
use einvoice::webhooks::WebhookIngestion;

use crate::cli::ServeArgs;
use crate::infra::{
    AppState, InMemoryAuditLog, InMemoryInvoiceRepository, InMemoryMerchantRepository,
    InMemoryWebhookEventRepository, OAuthStateStore,
};
use crate::routes::{api_router, Services};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let invoices = Arc::new(InMemoryInvoiceRepository::default());
    let merchants = Arc::new(InMemoryMerchantRepository::default());
    let events = Arc::new(InMemoryWebhookEventRepository::default());
    let audit = Arc::new(InMemoryAuditLog::default());

    let registry = Arc::new(HttpRegistryClient::new(&config.registry)?);
    let engine = Arc::new(ReconciliationEngine::new(invoices.clone(), audit.clone()));
    let credentials = Arc::new(CredentialStore::new(merchants.clone(), registry.clone()));

    let submission = SubmissionService::new(
        engine.clone(),
        invoices.clone(),
        merchants.clone(),
        credentials.clone(),
        registry.clone(),
    );
    let sweep_backoff = BackoffPolicy {
        base_delay: config.registry.retry_base_delay,
        ..BackoffPolicy::default()
    };
    let sweep = PollingSweep::new(
        engine.clone(),
        invoices.clone(),
        merchants.clone(),
        credentials.clone(),
        registry.clone(),
        audit.clone(),
        sweep_backoff,
    );
    let ingestion = Arc::new(WebhookIngestion::new(
        engine,
        invoices.clone(),
        events,
        audit,
        config.registry.webhook_secret.clone(),
        MerchantId("default".to_string()),
    ));

    let services = Arc::new(Services {
        invoices,
        merchants,
        credentials,
        registry,
        submission,
        sweep,
        oauth_states: OAuthStateStore::default(),
        sweep_defaults: SweepConfig::from_defaults(&config.polling),
        redirect_uri: config.registry.redirect_uri.clone(),
    });

    let app = api_router(services, ingestion)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "invoice reconciliation service ready");

    axum::serve(listener, app).await?;
    Ok(())
}
