use axum::routing::get;
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lead_qualifier_api::batch::BatchOrchestrator;
use lead_qualifier_api::config::Config;
use lead_qualifier_api::handlers::{self, AppState};
use lead_qualifier_api::pipeline::LeadQualifier;
use lead_qualifier_api::rate_limit::RateLimiter;
use lead_qualifier_api::services::{
    CrmClient, EnrichmentClient, NotificationClient, ScoringClient,
};
use lead_qualifier_api::storage::PgLeadStore;
use lead_qualifier_api::webhooks::{WebhookDispatcher, WebhookRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lead_qualifier_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection pool established");

    let store = Arc::new(PgLeadStore::new(pool));
    let limiter = Arc::new(RateLimiter::new(
        config.scoring.global_bucket,
        config.scoring.caller_bucket,
    ));
    let registry = Arc::new(WebhookRegistry::new());
    let dispatcher = Arc::new(WebhookDispatcher::new());

    let enrichment = EnrichmentClient::new(
        config.enrichment_base_url.clone(),
        config.enrichment_api_key.clone(),
    );
    let scoring = ScoringClient::new(
        config.scoring_base_url.clone(),
        config.scoring_api_key.clone(),
        config.scoring_model.clone(),
        config.scoring.provider_timeout,
    );
    let crm = Arc::new(CrmClient::new(
        config.crm_base_url.clone(),
        config.crm_api_key.clone(),
        config.crm_pipeline_id.clone(),
        config.crm_owner_email.clone(),
    ));
    let notifier = Arc::new(NotificationClient::new(
        config.notification_webhook_url.clone(),
    ));

    let qualifier = Arc::new(LeadQualifier::new(
        store,
        enrichment,
        scoring,
        crm,
        notifier,
        limiter.clone(),
        config.scoring.clone(),
        config.scoring_model.clone(),
        config.crm_owner_email.clone(),
        dispatcher.clone(),
        registry.clone(),
    ));
    let batches = Arc::new(BatchOrchestrator::new(
        qualifier.clone(),
        dispatcher.clone(),
        registry.clone(),
        config.webhook_signing_secret.clone(),
        config.batch_workers,
        config.scoring.lead_deadline,
    ));

    let state = AppState {
        qualifier,
        batches,
        registry,
        limiter,
    };

    // Ingress limiter: 10 requests/second per IP with a burst of 20. The
    // pipeline's own token buckets guard the scoring provider budget.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    let api_routes = handlers::router(state).layer(
        ServiceBuilder::new()
            .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );

    // Health check bypasses rate limiting so deploy probes never 429.
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Lead qualification API listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
