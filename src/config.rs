use crate::models::{LeadTier, RoutingAction};
use crate::rate_limit::BucketConfig;
use crate::scoring::{ScoringWeights, ThresholdRule, ThresholdTable};
use std::str::FromStr;
use std::time::Duration;

/// Process-wide configuration, loaded once at startup. Scoring weights and
/// the threshold table are validated here; an invalid table prevents the
/// process from starting instead of surfacing per-request.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub scoring_base_url: String,
    pub scoring_api_key: String,
    pub scoring_model: String,
    pub enrichment_base_url: String,
    pub enrichment_api_key: Option<String>,
    pub crm_base_url: Option<String>,
    pub crm_api_key: Option<String>,
    pub crm_pipeline_id: String,
    pub crm_owner_email: Option<String>,
    pub notification_webhook_url: Option<String>,
    /// Secret used to sign outbound event deliveries that have no
    /// per-registration secret (e.g. a batch job's completion URL).
    pub webhook_signing_secret: String,
    pub batch_workers: usize,
    pub scoring: ScoringSettings,
}

/// Scoring pipeline knobs: weights, thresholds, retry budget and the token
/// bucket plans for the scoring provider and API callers.
#[derive(Debug, Clone)]
pub struct ScoringSettings {
    pub weights: ScoringWeights,
    pub thresholds: ThresholdTable,
    /// Retries after the first scoring attempt, for transient errors only.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub retry_backoff: Duration,
    pub provider_timeout: Duration,
    /// How long a pipeline invocation may wait on the provider bucket.
    pub acquire_deadline: Duration,
    /// Whole-pipeline deadline applied per lead in batch processing.
    pub lead_deadline: Duration,
    pub global_bucket: BucketConfig,
    pub caller_bucket: BucketConfig,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            thresholds: ThresholdTable::default(),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            provider_timeout: Duration::from_secs(15),
            acquire_deadline: Duration::from_secs(10),
            lead_deadline: Duration::from_secs(30),
            global_bucket: BucketConfig {
                capacity: 20,
                refill_per_sec: 10.0,
            },
            caller_bucket: BucketConfig {
                capacity: 10,
                refill_per_sec: 2.0,
            },
        }
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .map_err(|_| anyhow::anyhow!("{} environment variable required", name))
        .and_then(|v| {
            if v.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            Ok(v)
        })
}

fn required_url(name: &str) -> anyhow::Result<String> {
    let url = required(name)?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(url)
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parse_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match optional(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, raw)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = ScoringSettings::default();

        let weights = match optional("SCORING_WEIGHTS") {
            Some(raw) => parse_weights(&raw)?,
            None => defaults.weights,
        };
        weights
            .validate()
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let thresholds = match optional("SCORING_THRESHOLDS") {
            Some(raw) => parse_thresholds(&raw)?,
            None => defaults.thresholds.clone(),
        };

        let scoring = ScoringSettings {
            weights,
            thresholds,
            max_retries: parse_or("SCORING_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff: Duration::from_millis(parse_or("SCORING_RETRY_BACKOFF_MS", 500u64)?),
            provider_timeout: Duration::from_secs(parse_or("SCORING_TIMEOUT_SECS", 15u64)?),
            acquire_deadline: Duration::from_secs(parse_or("RATE_ACQUIRE_DEADLINE_SECS", 10u64)?),
            lead_deadline: Duration::from_secs(parse_or("LEAD_DEADLINE_SECS", 30u64)?),
            global_bucket: BucketConfig {
                capacity: parse_or("SCORING_BURST_CAPACITY", 20u32)?,
                refill_per_sec: parse_or("SCORING_REFILL_PER_SEC", 10.0f64)?,
            },
            caller_bucket: BucketConfig {
                capacity: parse_or("CALLER_BURST_CAPACITY", 10u32)?,
                refill_per_sec: parse_or("CALLER_REFILL_PER_SEC", 2.0f64)?,
            },
        };

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable required"))
                .and_then(|url| {
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DATABASE_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: parse_or("PORT", 3000u16)?,
            scoring_base_url: required_url("SCORING_BASE_URL")?,
            scoring_api_key: required("SCORING_API_KEY")?,
            scoring_model: optional("SCORING_MODEL").unwrap_or_else(|| "icp-scorer-v2".to_string()),
            enrichment_base_url: required_url("ENRICHMENT_BASE_URL")?,
            enrichment_api_key: optional("ENRICHMENT_API_KEY"),
            crm_base_url: optional("CRM_BASE_URL"),
            crm_api_key: optional("CRM_API_KEY"),
            crm_pipeline_id: optional("CRM_PIPELINE_ID").unwrap_or_else(|| "default".to_string()),
            crm_owner_email: optional("CRM_OWNER_EMAIL"),
            notification_webhook_url: optional("NOTIFICATION_WEBHOOK_URL"),
            webhook_signing_secret: required("WEBHOOK_SIGNING_SECRET")?,
            batch_workers: parse_or("BATCH_WORKERS", 5usize)?,
            scoring,
        };

        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Scoring provider: {}", config.scoring_base_url);
        tracing::debug!("Enrichment provider: {}", config.enrichment_base_url);
        tracing::debug!(
            "Batch workers: {}, scoring bucket: {}@{}/s",
            config.batch_workers,
            config.scoring.global_bucket.capacity,
            config.scoring.global_bucket.refill_per_sec
        );

        Ok(config)
    }
}

/// Parses `"0.35,0.30,0.20,0.15"` into a weight vector.
fn parse_weights(raw: &str) -> anyhow::Result<ScoringWeights> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow::anyhow!("SCORING_WEIGHTS must be four comma-separated numbers"))?;
    if parts.len() != 4 {
        anyhow::bail!(
            "SCORING_WEIGHTS must have exactly four entries, got {}",
            parts.len()
        );
    }
    Ok(ScoringWeights {
        company_fit: parts[0],
        intent_signal: parts[1],
        budget_indicator: parts[2],
        urgency: parts[3],
    })
}

/// Parses `"80:HOT:route_to_ae,50:WARM:add_to_nurture,0:COLD:add_to_marketing"`
/// into a validated threshold table.
fn parse_thresholds(raw: &str) -> anyhow::Result<ThresholdTable> {
    let mut rules = Vec::new();
    for entry in raw.split(',') {
        let mut fields = entry.trim().split(':');
        let (min, tier, action) = match (fields.next(), fields.next(), fields.next()) {
            (Some(m), Some(t), Some(a)) => (m, t, a),
            _ => anyhow::bail!(
                "SCORING_THRESHOLDS entry '{}' must be min_score:TIER:action",
                entry
            ),
        };
        rules.push(ThresholdRule {
            min_score: min
                .parse::<u8>()
                .map_err(|_| anyhow::anyhow!("invalid min_score '{}' in SCORING_THRESHOLDS", min))?,
            tier: LeadTier::from_str(tier).map_err(|e| anyhow::anyhow!(e))?,
            action: parse_action(action)?,
        });
    }
    ThresholdTable::new(rules).map_err(|e| anyhow::anyhow!(e.to_string()))
}

fn parse_action(raw: &str) -> anyhow::Result<RoutingAction> {
    match raw {
        "route_to_ae" => Ok(RoutingAction::RouteToAe),
        "add_to_nurture" => Ok(RoutingAction::AddToNurture),
        "add_to_marketing" => Ok(RoutingAction::AddToMarketing),
        "archive" => Ok(RoutingAction::Archive),
        "manual_review" => Ok(RoutingAction::ManualReview),
        other => anyhow::bail!("unknown routing action '{}'", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_shaped_threshold_string() {
        let table =
            parse_thresholds("80:HOT:route_to_ae,50:WARM:add_to_nurture,0:COLD:add_to_marketing")
                .unwrap();
        assert_eq!(table.rules().len(), 3);
        assert_eq!(table.classify(80).unwrap().0, LeadTier::Hot);
    }

    #[test]
    fn threshold_string_without_floor_rejected() {
        assert!(parse_thresholds("80:HOT:route_to_ae,50:WARM:add_to_nurture").is_err());
    }

    #[test]
    fn parses_weight_string() {
        let w = parse_weights("0.4, 0.3, 0.2, 0.1").unwrap();
        assert!(w.validate().is_ok());
        assert!((w.company_fit - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn weight_string_with_wrong_arity_rejected() {
        assert!(parse_weights("0.5,0.5").is_err());
    }
}
