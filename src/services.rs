//! External collaborator clients: enrichment provider, scoring-intelligence
//! provider, CRM connector and notification channel.
//!
//! All clients take their base URL explicitly so tests can point them at a
//! mock server. The scoring client is the only one with hard-failure
//! semantics; enrichment, CRM and notifications are best-effort from the
//! pipeline's point of view.

use crate::circuit_breaker::{create_scoring_circuit_breaker, ScoringBreaker};
use crate::errors::AppError;
use crate::models::{EnrichmentData, LeadInput, QualificationResult, SubScores};
use crate::retry::is_transient_status;
use moka::future::Cache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Buckets an employee count the way downstream dashboards expect.
pub fn classify_company_size(employee_count: u32) -> &'static str {
    match employee_count {
        0..=9 => "1-10",
        10..=49 => "10-50",
        50..=199 => "50-200",
        200..=999 => "200-1000",
        _ => "1000+",
    }
}

/// Rough revenue bucket from headcount, used when the provider returns none.
pub fn estimate_revenue(employee_count: u32) -> &'static str {
    match employee_count {
        0..=49 => "$1M-$10M",
        50..=199 => "$10M-$50M",
        200..=999 => "$50M-$200M",
        _ => "$200M+",
    }
}

/// Client for the company-attribute enrichment provider.
///
/// Lookups are cached by domain for 24 hours; the pipeline treats every
/// failure here as a degraded-but-scoreable condition.
pub struct EnrichmentClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    cache: Cache<String, Option<EnrichmentData>>,
}

impl EnrichmentClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url,
            api_key,
            cache: Cache::builder()
                .time_to_live(Duration::from_secs(86400))
                .max_capacity(50_000)
                .build(),
        }
    }

    /// Looks up company attributes for a lead's email domain.
    ///
    /// Returns `Ok(None)` when the provider has no record; fails with
    /// `Transient` on network errors or non-success statuses.
    pub async fn lookup(&self, email: &str) -> Result<Option<EnrichmentData>, AppError> {
        let Some(domain) = email.split('@').nth(1).filter(|d| !d.is_empty()) else {
            return Ok(None);
        };
        let cache_key = domain.to_lowercase();

        if let Some(cached) = self.cache.get(&cache_key).await {
            tracing::debug!("Enrichment cache hit for domain {}", cache_key);
            return Ok(cached);
        }

        let url = reqwest::Url::parse_with_params(
            &format!("{}/v1/companies/find", self.base_url),
            &[("domain", cache_key.as_str())],
        )
        .map_err(|e| AppError::Transient(format!("Failed to build enrichment URL: {}", e)))?;

        let mut request = self.client.get(url);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            AppError::Transient(format!("Enrichment request failed: {}", e))
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            self.cache.insert(cache_key, None).await;
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "Enrichment provider returned status {}",
                response.status()
            )));
        }

        let mut data: EnrichmentData = response.json().await.map_err(|e| {
            AppError::Transient(format!("Failed to parse enrichment response: {}", e))
        })?;

        // Fill derived buckets the provider may omit.
        if let Some(count) = data.employee_count {
            if data.company_size.is_none() {
                data.company_size = Some(classify_company_size(count).to_string());
            }
            if data.estimated_revenue.is_none() {
                data.estimated_revenue = Some(estimate_revenue(count).to_string());
            }
        }

        self.cache.insert(cache_key, Some(data.clone())).await;
        Ok(Some(data))
    }
}

/// Structured context sent to the scoring-intelligence provider.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext<'a> {
    pub email: &'a str,
    pub company: Option<&'a str>,
    pub name: Option<&'a str>,
    pub message: Option<&'a str>,
    pub enrichment: Option<&'a EnrichmentData>,
}

impl<'a> PromptContext<'a> {
    pub fn from_lead(lead: &'a LeadInput, enrichment: Option<&'a EnrichmentData>) -> Self {
        Self {
            email: &lead.email,
            company: lead.company.as_deref(),
            name: lead.name.as_deref(),
            message: lead.message.as_deref(),
            enrichment,
        }
    }
}

/// Parsed scoring provider response.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoreResponse {
    pub company_fit: f64,
    pub intent_signal: f64,
    pub budget_indicator: f64,
    pub urgency: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<i64>,
}

impl ScoreResponse {
    pub fn sub_scores(&self) -> SubScores {
        SubScores {
            company_fit: self.company_fit,
            intent_signal: self.intent_signal,
            budget_indicator: self.budget_indicator,
            urgency: self.urgency,
        }
    }
}

/// Client for the scoring-intelligence provider.
///
/// A circuit breaker fails calls fast during a sustained outage; transient
/// statuses (5xx, 429) surface as `Transient` so the pipeline's retry
/// policy applies, other 4xx surface as hard `ScoringProvider` errors.
pub struct ScoringClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    breaker: ScoringBreaker,
}

impl ScoringClient {
    pub fn new(base_url: String, api_key: String, model: String, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url,
            api_key,
            model,
            breaker: create_scoring_circuit_breaker(),
        }
    }

    /// One scoring attempt. Retrying is the pipeline's job.
    pub async fn score(
        &self,
        context: &PromptContext<'_>,
    ) -> Result<(ScoreResponse, Value), AppError> {
        use failsafe::futures::CircuitBreaker;

        match self.breaker.call(self.score_once(context)).await {
            Ok(parsed) => Ok(parsed),
            Err(failsafe::Error::Inner(e)) => Err(e),
            Err(failsafe::Error::Rejected) => Err(AppError::ScoringProvider(
                "scoring provider circuit open".to_string(),
            )),
        }
    }

    async fn score_once(
        &self,
        context: &PromptContext<'_>,
    ) -> Result<(ScoreResponse, Value), AppError> {
        let body = json!({
            "model": self.model,
            "lead": context,
        });

        let response = self
            .client
            .post(format!("{}/v1/score", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("Scoring request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return if is_transient_status(status) {
                Err(AppError::Transient(format!(
                    "Scoring provider returned status {}: {}",
                    status, error_text
                )))
            } else {
                Err(AppError::ScoringProvider(format!(
                    "Scoring provider rejected request with status {}: {}",
                    status, error_text
                )))
            };
        }

        let raw: Value = response.json().await.map_err(|e| {
            AppError::Transient(format!("Failed to parse scoring response: {}", e))
        })?;
        let parsed: ScoreResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            AppError::ScoringProvider(format!("Malformed scoring response: {}", e))
        })?;

        Ok((parsed, raw))
    }
}

/// Client for the CRM connector. Unconfigured deployments sync nothing.
pub struct CrmClient {
    client: Client,
    base_url: Option<String>,
    api_key: Option<String>,
    pipeline_id: String,
    owner_email: Option<String>,
}

impl CrmClient {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        pipeline_id: String,
        owner_email: Option<String>,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url,
            api_key,
            pipeline_id,
            owner_email,
        }
    }

    /// Pushes a qualified lead to the CRM. Returns the remote record id,
    /// or `Ok(None)` when no CRM is configured.
    pub async fn sync(
        &self,
        email: &str,
        result: &QualificationResult,
    ) -> Result<Option<String>, AppError> {
        let Some(ref base_url) = self.base_url else {
            return Ok(None);
        };

        let payload = json!({
            "email": email,
            "pipeline": self.pipeline_id,
            "owner_email": self.owner_email,
            "properties": {
                "lead_score": result.score,
                "lead_tier": result.tier.as_str(),
                "qualification_reasoning": result.reasoning,
                "recommended_action": result.recommended_action.as_str(),
            },
        });

        let mut request = self
            .client
            .post(format!("{}/v1/leads/sync", base_url))
            .json(&payload);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("CRM request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "CRM returned status {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::Transient(format!("Failed to parse CRM response: {}", e)))?;
        Ok(body
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }
}

/// Client for the alert channel (Slack-style incoming webhook).
pub struct NotificationClient {
    client: Client,
    webhook_url: Option<String>,
}

impl NotificationClient {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            webhook_url,
        }
    }

    /// Posts a hot-lead alert. Fire-and-forget from the pipeline's
    /// perspective; failure is recorded on the routing record only.
    pub async fn notify_hot_lead(
        &self,
        email: &str,
        company: Option<&str>,
        result: &QualificationResult,
    ) -> Result<(), AppError> {
        let Some(ref url) = self.webhook_url else {
            return Ok(());
        };

        let message = json!({
            "blocks": [
                {
                    "type": "header",
                    "text": { "type": "plain_text", "text": format!("New {} Lead", result.tier.as_str()) }
                },
                {
                    "type": "section",
                    "fields": [
                        { "type": "mrkdwn", "text": format!("*Company:* {}", company.unwrap_or("N/A")) },
                        { "type": "mrkdwn", "text": format!("*Contact:* {}", email) },
                        { "type": "mrkdwn", "text": format!("*Score:* {}/100", result.score) },
                        { "type": "mrkdwn", "text": format!("*Action:* {}", result.recommended_action.as_str()) },
                    ]
                }
            ]
        });

        let response = self
            .client
            .post(url)
            .json(&message)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("Notification request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "Notification channel returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn company_size_buckets() {
        assert_eq!(classify_company_size(3), "1-10");
        assert_eq!(classify_company_size(49), "10-50");
        assert_eq!(classify_company_size(50), "50-200");
        assert_eq!(classify_company_size(999), "200-1000");
        assert_eq!(classify_company_size(20_000), "1000+");
    }

    #[test]
    fn revenue_buckets() {
        assert_eq!(estimate_revenue(10), "$1M-$10M");
        assert_eq!(estimate_revenue(150), "$10M-$50M");
        assert_eq!(estimate_revenue(5_000), "$200M+");
    }
}
