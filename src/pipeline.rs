//! The qualification pipeline: validate, rate-limit, enrich, score,
//! classify, persist, route.
//!
//! Enrichment is best-effort and failure there degrades the run; a scoring
//! failure after the retry budget fails the whole run. Post-commit side
//! effects (notification, CRM sync) never change the returned result.

use crate::config::ScoringSettings;
use crate::errors::AppError;
use crate::models::{
    EnrichmentSource, LeadInput, LeadStatus, LeadTier, QualificationResult, RoutingRecord,
};
use crate::rate_limit::{RateLimiter, Scope};
use crate::retry::backoff_delay;
use crate::scoring::fallback_reasoning;
use crate::services::{
    CrmClient, EnrichmentClient, NotificationClient, PromptContext, ScoringClient,
};
use crate::storage::{LeadStore, NewEnrichment, NewQualification};
use crate::webhooks::{WebhookDispatcher, WebhookRegistry};
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

const ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(5);

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";

const FAKE_DOMAINS: &[&str] = &[
    "example.com",
    "example.org",
    "test.com",
    "mailinator.com",
    "guerrillamail.com",
];

const FAKE_LOCAL_PARTS: &[&str] = &["test", "demo", "fake", "asdf", "qwerty", "noreply"];

/// Checks shape and obvious fake patterns. Deliverability is out of scope;
/// this only rejects input that could never identify a real buyer.
pub fn is_valid_email(email: &str) -> bool {
    if email.is_empty() || email.len() > 254 {
        return false;
    }
    if !Regex::new(EMAIL_PATTERN)
        .map(|re| re.is_match(email))
        .unwrap_or(false)
    {
        return false;
    }

    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let local = local.to_lowercase();
    let domain = domain.to_lowercase();

    if FAKE_DOMAINS.contains(&domain.as_str()) {
        return false;
    }
    // "test", "test123" and similar throwaway local parts.
    let stem = local.trim_end_matches(|c: char| c.is_ascii_digit());
    if FAKE_LOCAL_PARTS.contains(&stem) {
        return false;
    }
    // Keyboard-mash local parts like "aaaaaa".
    let mut chars = local.chars();
    if let Some(first) = chars.next() {
        if local.len() >= 4 && chars.all(|c| c == first) {
            return false;
        }
    }
    true
}

/// Validates a lead before any tokens are spent or rows written.
pub fn validate_lead(input: &LeadInput) -> Result<(), AppError> {
    if input.email.trim().is_empty() {
        return Err(AppError::Validation("email is required".to_string()));
    }
    if !is_valid_email(input.email.trim()) {
        return Err(AppError::Validation(format!(
            "'{}' is not a valid business email",
            input.email
        )));
    }
    Ok(())
}

/// Object-safe-ish seam between the orchestrator and the pipeline, so batch
/// tests can swap in a scripted qualifier.
pub trait Qualify: Send + Sync + 'static {
    fn qualify(
        &self,
        input: LeadInput,
    ) -> impl Future<Output = Result<QualificationResult, AppError>> + Send;
}

/// The qualification pipeline over a concrete store.
pub struct LeadQualifier<S: LeadStore> {
    store: Arc<S>,
    enrichment: EnrichmentClient,
    scoring: ScoringClient,
    crm: Arc<CrmClient>,
    notifier: Arc<NotificationClient>,
    limiter: Arc<RateLimiter>,
    settings: ScoringSettings,
    default_model: String,
    ae_assignee: Option<String>,
    dispatcher: Arc<WebhookDispatcher>,
    registry: Arc<WebhookRegistry>,
    // Serializes the persist step per lead email so concurrent
    // re-qualifications of the same lead cannot interleave audits.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: LeadStore> LeadQualifier<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        enrichment: EnrichmentClient,
        scoring: ScoringClient,
        crm: Arc<CrmClient>,
        notifier: Arc<NotificationClient>,
        limiter: Arc<RateLimiter>,
        settings: ScoringSettings,
        default_model: String,
        ae_assignee: Option<String>,
        dispatcher: Arc<WebhookDispatcher>,
        registry: Arc<WebhookRegistry>,
    ) -> Self {
        Self {
            store,
            enrichment,
            scoring,
            crm,
            notifier,
            limiter,
            settings,
            default_model,
            ae_assignee,
            dispatcher,
            registry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Fans an event out to every subscribed endpoint, off the hot path.
    fn emit_event(&self, event: &'static str, payload: Value) {
        let subscribers = self.registry.subscribers(event);
        if subscribers.is_empty() {
            return;
        }
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            for subscriber in subscribers {
                dispatcher
                    .deliver(&subscriber.url, event, &payload, &subscriber.secret)
                    .await;
            }
        });
    }

    fn lead_lock(&self, email: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("lead lock map mutex poisoned");
        locks
            .entry(email.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Runs the full pipeline for one lead.
    pub async fn qualify_lead(
        &self,
        mut input: LeadInput,
    ) -> Result<QualificationResult, AppError> {
        let started = Instant::now();

        validate_lead(&input)?;
        input.email = input.email.trim().to_lowercase();
        let email = input.email.clone();

        self.limiter
            .acquire(Scope::Global, 1, self.settings.acquire_deadline)
            .await?;

        let (enrichment_data, enrichment_degraded) =
            match tokio::time::timeout(ENRICHMENT_TIMEOUT, self.enrichment.lookup(&email)).await {
                Ok(Ok(data)) => (data, false),
                Ok(Err(e)) => {
                    tracing::warn!("Enrichment failed for {}, scoring without it: {}", email, e);
                    (None, true)
                }
                Err(_) => {
                    tracing::warn!("Enrichment timed out for {}, scoring without it", email);
                    (None, true)
                }
            };

        let context = PromptContext::from_lead(&input, enrichment_data.as_ref());
        let scoring_started = Instant::now();
        let mut retries = 0u32;
        let (response, raw_response) = loop {
            match self.scoring.score(&context).await {
                Ok(ok) => break ok,
                Err(AppError::Transient(msg)) if retries < self.settings.max_retries => {
                    let delay = backoff_delay(self.settings.retry_backoff, retries);
                    tracing::warn!(
                        "Scoring attempt {} for {} failed transiently ({}), retrying in {:?}",
                        retries + 1,
                        email,
                        msg,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(AppError::Transient(msg)) => {
                    return Err(AppError::ScoringProvider(format!(
                        "Scoring failed after {} retries: {}",
                        retries, msg
                    )));
                }
                Err(other) => return Err(other),
            }
        };
        let scoring_latency = scoring_started.elapsed();

        let sub_scores = response.sub_scores();
        let score = self.settings.weights.compose(&sub_scores);
        let (tier, action) = self.settings.thresholds.classify(score)?;
        let reasoning = response
            .reasoning
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| fallback_reasoning(&sub_scores, tier));
        let model_version = response
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let status = if tier == LeadTier::Disqualified {
            LeadStatus::Disqualified
        } else {
            LeadStatus::Qualified
        };

        let qualification = NewQualification {
            score: score as i32,
            tier,
            action,
            reasoning: reasoning.clone(),
            status,
            model_version: model_version.clone(),
            sub_scores,
            tokens_used: response.tokens_used.unwrap_or(0),
            latency_ms: scoring_latency.as_millis() as i64,
            retries: retries as i32,
            raw_response,
            enrichment: enrichment_data.as_ref().map(|data| NewEnrichment {
                source: EnrichmentSource::Api,
                data: data.clone(),
                raw: serde_json::to_value(data).unwrap_or(Value::Null),
            }),
        };

        let lead = {
            let lock = self.lead_lock(&email);
            let _guard = lock.lock().await;
            self.store.record_qualification(&input, &qualification).await?
        };

        let result = QualificationResult {
            lead_id: lead.id,
            score,
            tier,
            recommended_action: action,
            reasoning,
            breakdown: sub_scores,
            enrichment: enrichment_data,
            enrichment_degraded,
            retries,
            model_version,
            processing_time_ms: started.elapsed().as_millis() as u64,
            qualified_at: Utc::now(),
        };

        tracing::info!(
            "Qualified {} as {} (score {}, action {}, {} retries)",
            email,
            tier.as_str(),
            score,
            action.as_str(),
            retries
        );

        self.emit_event(
            "lead.qualified",
            serde_json::to_value(&result).unwrap_or(Value::Null),
        );

        if tier == LeadTier::Hot {
            self.spawn_routing(&input, &result);
        }

        Ok(result)
    }

    /// Fires the hot-lead side effects after the qualification committed.
    /// Failures here are recorded on the routing record and logged; the
    /// already-returned result is not touched.
    fn spawn_routing(&self, input: &LeadInput, result: &QualificationResult) {
        let store = self.store.clone();
        let crm = self.crm.clone();
        let notifier = self.notifier.clone();
        let dispatcher = self.dispatcher.clone();
        let registry = self.registry.clone();
        let assignee = self.ae_assignee.clone();
        let email = input.email.clone();
        let company = input.company.clone();
        let result = result.clone();

        tokio::spawn(async move {
            let notification_sent = match notifier
                .notify_hot_lead(&email, company.as_deref(), &result)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Hot-lead notification failed for {}: {}", email, e);
                    false
                }
            };

            let (crm_synced, crm_remote_id) = match crm.sync(&email, &result).await {
                Ok(remote_id) => (true, remote_id),
                Err(e) => {
                    tracing::warn!("CRM sync failed for {}: {}", email, e);
                    (false, None)
                }
            };

            let routed = notification_sent && crm_synced;
            let record = RoutingRecord {
                id: Uuid::new_v4(),
                lead_id: result.lead_id,
                assignee,
                reason: format!(
                    "score {} meets the {} threshold",
                    result.score,
                    result.tier.as_str()
                ),
                notification_sent,
                crm_synced,
                crm_remote_id,
                created_at: Utc::now(),
            };
            let status = if routed {
                LeadStatus::Routed
            } else {
                LeadStatus::Qualified
            };

            if let Err(e) = store.record_routing(&record, status).await {
                tracing::error!("Failed to record routing for lead {}: {}", result.lead_id, e);
            } else if routed {
                tracing::info!("Routed lead {} to account executive", result.lead_id);
            }

            // Partial failure is visible to subscribers through the flags.
            let payload = serde_json::to_value(&record).unwrap_or(Value::Null);
            for subscriber in registry.subscribers("lead.routed") {
                dispatcher
                    .deliver(&subscriber.url, "lead.routed", &payload, &subscriber.secret)
                    .await;
            }
        });
    }
}

impl<S: LeadStore> Qualify for LeadQualifier<S> {
    async fn qualify(&self, input: LeadInput) -> Result<QualificationResult, AppError> {
        self.qualify_lead(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_normal_business_email() {
        assert!(is_valid_email("maria.santos@acmecorp.com"));
        assert!(is_valid_email("cto@startup.io"));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("missing@tld"));
        assert!(!is_valid_email("@nolocal.com"));
    }

    #[test]
    fn rejects_fake_domains() {
        assert!(!is_valid_email("someone@example.com"));
        assert!(!is_valid_email("buyer@mailinator.com"));
    }

    #[test]
    fn rejects_throwaway_local_parts() {
        assert!(!is_valid_email("test@realcompany.com"));
        assert!(!is_valid_email("test123@realcompany.com"));
        assert!(!is_valid_email("asdf@realcompany.com"));
        assert!(!is_valid_email("aaaaaa@realcompany.com"));
    }

    #[test]
    fn validation_error_names_the_email() {
        let err = validate_lead(&LeadInput::new("bogus")).unwrap_err();
        match err {
            AppError::Validation(msg) => assert!(msg.contains("bogus")),
            other => panic!("expected Validation, got {}", other),
        }
    }
}
