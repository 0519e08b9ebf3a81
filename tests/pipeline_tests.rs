//! End-to-end pipeline tests against mocked providers and the in-memory
//! store.

use lead_qualifier_api::config::ScoringSettings;
use lead_qualifier_api::errors::AppError;
use lead_qualifier_api::models::{LeadInput, LeadTier, RoutingAction};
use lead_qualifier_api::pipeline::LeadQualifier;
use lead_qualifier_api::rate_limit::{BucketConfig, RateLimiter};
use lead_qualifier_api::services::{
    CrmClient, EnrichmentClient, NotificationClient, ScoringClient,
};
use lead_qualifier_api::storage::MemoryLeadStore;
use lead_qualifier_api::webhooks::{WebhookDispatcher, WebhookRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_settings() -> ScoringSettings {
    let mut settings = ScoringSettings::default();
    settings.retry_backoff = Duration::from_millis(10);
    settings.acquire_deadline = Duration::from_millis(500);
    settings
}

fn build_qualifier(
    scoring_uri: &str,
    enrichment_uri: &str,
    store: Arc<MemoryLeadStore>,
    settings: ScoringSettings,
) -> LeadQualifier<MemoryLeadStore> {
    LeadQualifier::new(
        store,
        EnrichmentClient::new(enrichment_uri.to_string(), None),
        ScoringClient::new(
            scoring_uri.to_string(),
            "test-key".to_string(),
            "icp-scorer-v2".to_string(),
            Duration::from_secs(5),
        ),
        Arc::new(CrmClient::new(None, None, "default".to_string(), None)),
        Arc::new(NotificationClient::new(None)),
        Arc::new(RateLimiter::new(
            BucketConfig {
                capacity: 100,
                refill_per_sec: 100.0,
            },
            BucketConfig {
                capacity: 100,
                refill_per_sec: 100.0,
            },
        )),
        settings,
        "icp-scorer-v2".to_string(),
        None,
        Arc::new(WebhookDispatcher::new()),
        Arc::new(WebhookRegistry::new()),
    )
}

fn hot_scores() -> serde_json::Value {
    json!({
        "company_fit": 0.92,
        "intent_signal": 0.85,
        "budget_indicator": 0.78,
        "urgency": 0.70,
        "reasoning": "Enterprise ICP match with active evaluation",
    })
}

fn warm_scores() -> serde_json::Value {
    json!({
        "company_fit": 0.6,
        "intent_signal": 0.5,
        "budget_indicator": 0.5,
        "urgency": 0.4,
    })
}

#[tokio::test]
async fn hot_lead_is_scored_enriched_and_persisted() {
    let scoring = MockServer::start().await;
    let enrichment = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/score"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hot_scores()))
        .mount(&scoring)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/companies/find"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "company_name": "Acme Corp",
            "industry": "Software",
            "employee_count": 250,
        })))
        .mount(&enrichment)
        .await;

    let store = Arc::new(MemoryLeadStore::new());
    let qualifier = build_qualifier(
        &scoring.uri(),
        &enrichment.uri(),
        store.clone(),
        fast_settings(),
    );

    let mut input = LeadInput::new("Maria.Santos@acmecorp.com");
    input.company = Some("Acme Corp".to_string());
    let result = qualifier.qualify_lead(input).await.unwrap();

    assert_eq!(result.score, 84);
    assert_eq!(result.tier, LeadTier::Hot);
    assert_eq!(result.recommended_action, RoutingAction::RouteToAe);
    assert!(!result.enrichment_degraded);
    assert_eq!(result.retries, 0);
    let enrichment_data = result.enrichment.unwrap();
    assert_eq!(enrichment_data.company_name.as_deref(), Some("Acme Corp"));
    // Derived buckets filled from headcount.
    assert_eq!(enrichment_data.company_size.as_deref(), Some("200-1000"));

    // Email was normalized before persistence.
    let stored = store.lead("maria.santos@acmecorp.com").unwrap();
    assert_eq!(stored.lead.score, Some(84));
    assert_eq!(stored.audits.len(), 1);
    assert_eq!(stored.audits[0].1.final_score, 84);

    // The spawned routing step records its outcome shortly after.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = store.lead("maria.santos@acmecorp.com").unwrap();
    assert_eq!(stored.routings.len(), 1);
    assert!(stored.routings[0].notification_sent);
}

#[tokio::test]
async fn enrichment_outage_degrades_but_still_scores() {
    let scoring = MockServer::start().await;
    let enrichment = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/score"))
        .respond_with(ResponseTemplate::new(200).set_body_json(warm_scores()))
        .mount(&scoring)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/companies/find"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&enrichment)
        .await;

    let store = Arc::new(MemoryLeadStore::new());
    let qualifier = build_qualifier(
        &scoring.uri(),
        &enrichment.uri(),
        store.clone(),
        fast_settings(),
    );

    let result = qualifier
        .qualify_lead(LeadInput::new("cto@startup.io"))
        .await
        .unwrap();

    assert!(result.enrichment_degraded);
    assert!(result.enrichment.is_none());
    assert_eq!(result.tier, LeadTier::Warm);
    assert_eq!(store.lead_count(), 1);
}

#[tokio::test]
async fn transient_scoring_errors_are_retried() {
    let scoring = MockServer::start().await;
    let enrichment = MockServer::start().await;

    // Two 429s, then success. Matches the retry budget of two.
    Mock::given(method("POST"))
        .and(path("/v1/score"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&scoring)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/score"))
        .respond_with(ResponseTemplate::new(200).set_body_json(warm_scores()))
        .mount(&scoring)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/companies/find"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&enrichment)
        .await;

    let store = Arc::new(MemoryLeadStore::new());
    let qualifier = build_qualifier(
        &scoring.uri(),
        &enrichment.uri(),
        store.clone(),
        fast_settings(),
    );

    let result = qualifier
        .qualify_lead(LeadInput::new("ops@realcompany.com"))
        .await
        .unwrap();

    assert_eq!(result.retries, 2);
    let stored = store.lead("ops@realcompany.com").unwrap();
    assert_eq!(stored.audits[0].1.retries, 2);
}

#[tokio::test]
async fn exhausted_retry_budget_fails_without_persisting() {
    let scoring = MockServer::start().await;
    let enrichment = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/score"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&scoring)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/companies/find"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&enrichment)
        .await;

    let store = Arc::new(MemoryLeadStore::new());
    let qualifier = build_qualifier(
        &scoring.uri(),
        &enrichment.uri(),
        store.clone(),
        fast_settings(),
    );

    let err = qualifier
        .qualify_lead(LeadInput::new("ops@realcompany.com"))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::ScoringProvider(_)));
    assert_eq!(store.lead_count(), 0);
}

#[tokio::test]
async fn hard_provider_rejection_is_not_retried() {
    let scoring = MockServer::start().await;
    let enrichment = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/score"))
        .respond_with(ResponseTemplate::new(422))
        .expect(1)
        .mount(&scoring)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/companies/find"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&enrichment)
        .await;

    let store = Arc::new(MemoryLeadStore::new());
    let qualifier = build_qualifier(
        &scoring.uri(),
        &enrichment.uri(),
        store.clone(),
        fast_settings(),
    );

    let err = qualifier
        .qualify_lead(LeadInput::new("ops@realcompany.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ScoringProvider(_)));
}

#[tokio::test]
async fn invalid_email_rejected_before_any_provider_call() {
    let scoring = MockServer::start().await;
    let enrichment = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/score"))
        .respond_with(ResponseTemplate::new(200).set_body_json(warm_scores()))
        .expect(0)
        .mount(&scoring)
        .await;

    let store = Arc::new(MemoryLeadStore::new());
    let qualifier = build_qualifier(
        &scoring.uri(),
        &enrichment.uri(),
        store.clone(),
        fast_settings(),
    );

    let err = qualifier
        .qualify_lead(LeadInput::new("test@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(store.lead_count(), 0);
}

#[tokio::test]
async fn concurrent_requalifications_of_one_lead_are_serialized() {
    let scoring = MockServer::start().await;
    let enrichment = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/score"))
        .respond_with(ResponseTemplate::new(200).set_body_json(warm_scores()))
        .mount(&scoring)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/companies/find"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&enrichment)
        .await;

    let store = Arc::new(MemoryLeadStore::new());
    let qualifier = Arc::new(build_qualifier(
        &scoring.uri(),
        &enrichment.uri(),
        store.clone(),
        fast_settings(),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let qualifier = qualifier.clone();
        handles.push(tokio::spawn(async move {
            qualifier
                .qualify_lead(LeadInput::new("ops@realcompany.com"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Every audit saw a fresh snapshot; interleaved writes would have
    // failed above or produced duplicate snapshot versions.
    let stored = store.lead("ops@realcompany.com").unwrap();
    assert_eq!(stored.audits.len(), 8);
    let versions: Vec<u64> = stored.audits.iter().map(|(v, _)| *v).collect();
    let mut sorted = versions.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 8);
}
