use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use uuid::Uuid;

/// Inbound lead sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeadSource {
    Website,
    #[default]
    Api,
    CsvUpload,
    Referral,
    Partner,
    Manual,
}

/// Lead lifecycle status. Leads are never deleted by the engine; deletion
/// is a persistence-layer concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    #[default]
    New,
    Qualified,
    Routed,
    Converted,
    Disqualified,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Qualified => "qualified",
            LeadStatus::Routed => "routed",
            LeadStatus::Converted => "converted",
            LeadStatus::Disqualified => "disqualified",
        }
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(LeadStatus::New),
            "qualified" => Ok(LeadStatus::Qualified),
            "routed" => Ok(LeadStatus::Routed),
            "converted" => Ok(LeadStatus::Converted),
            "disqualified" => Ok(LeadStatus::Disqualified),
            other => Err(format!("unknown lead status '{}'", other)),
        }
    }
}

/// Qualification tiers derived from the final score via the threshold table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadTier {
    Hot,
    Warm,
    Cold,
    Disqualified,
}

impl LeadTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadTier::Hot => "HOT",
            LeadTier::Warm => "WARM",
            LeadTier::Cold => "COLD",
            LeadTier::Disqualified => "DISQUALIFIED",
        }
    }
}

impl FromStr for LeadTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HOT" => Ok(LeadTier::Hot),
            "WARM" => Ok(LeadTier::Warm),
            "COLD" => Ok(LeadTier::Cold),
            "DISQUALIFIED" => Ok(LeadTier::Disqualified),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Downstream action attached to a tier by the threshold table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAction {
    RouteToAe,
    AddToNurture,
    AddToMarketing,
    Archive,
    ManualReview,
}

impl RoutingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingAction::RouteToAe => "route_to_ae",
            RoutingAction::AddToNurture => "add_to_nurture",
            RoutingAction::AddToMarketing => "add_to_marketing",
            RoutingAction::Archive => "archive",
            RoutingAction::ManualReview => "manual_review",
        }
    }
}

/// Where an enrichment record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentSource {
    ProviderA,
    ProviderB,
    Manual,
    Api,
}

/// Inbound lead data from webhook or API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadInput {
    pub email: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub source: LeadSource,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl LeadInput {
    /// Minimal constructor used by tests and the batch CSV path.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            company: None,
            name: None,
            message: None,
            source: LeadSource::Api,
            metadata: HashMap::new(),
        }
    }
}

/// The Lead aggregate root as stored by the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub email: String,
    pub company: Option<String>,
    pub full_name: Option<String>,
    pub message: Option<String>,
    pub source: LeadSource,
    pub metadata: Value,
    pub score: Option<i32>,
    pub tier: Option<LeadTier>,
    pub status: LeadStatus,
    pub reasoning: Option<String>,
    pub recommended_action: Option<RoutingAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub qualified_at: Option<DateTime<Utc>>,
    pub routed_at: Option<DateTime<Utc>>,
}

/// Company/contact attributes returned by the enrichment provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentData {
    pub company_name: Option<String>,
    pub industry: Option<String>,
    pub employee_count: Option<u32>,
    pub company_size: Option<String>,
    pub estimated_revenue: Option<String>,
    pub location: Option<String>,
    pub website: Option<String>,
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
}

/// Append-only enrichment history row owned by a Lead. The pipeline uses
/// the most recent record per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub source: EnrichmentSource,
    pub data: EnrichmentData,
    pub raw: Value,
    pub fetched_at: DateTime<Utc>,
}

/// Four sub-scores in [0,1] produced by the scoring provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub company_fit: f64,
    pub intent_signal: f64,
    pub budget_indicator: f64,
    pub urgency: f64,
}

/// Append-only audit row, one per qualification run. The final score is a
/// deterministic function of the sub-scores and configured weights and is
/// never recomputed after creation; re-qualification creates a new row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringAudit {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub model_version: String,
    pub sub_scores: SubScores,
    pub final_score: i32,
    pub tokens_used: i64,
    pub latency_ms: i64,
    pub retries: i32,
    pub raw_response: Value,
    pub created_at: DateTime<Utc>,
}

/// Side-effect dispatch record owned by a Lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub assignee: Option<String>,
    pub reason: String,
    pub notification_sent: bool,
    pub crm_synced: bool,
    pub crm_remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Complete qualification result returned by the pipeline.
///
/// Wholly determined by the scoring steps; post-commit side-effect failures
/// never change the score/tier reported here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualificationResult {
    pub lead_id: Uuid,
    pub score: u8,
    pub tier: LeadTier,
    pub recommended_action: RoutingAction,
    pub reasoning: String,
    pub breakdown: SubScores,
    pub enrichment: Option<EnrichmentData>,
    /// Set when the enrichment provider failed or timed out and the lead
    /// was scored without enrichment context.
    pub enrichment_degraded: bool,
    /// Transient-error retries spent on the scoring provider call.
    pub retries: u32,
    pub model_version: String,
    pub processing_time_ms: u64,
    pub qualified_at: DateTime<Utc>,
}

/// Batch job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// Priority tag recorded on a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchPriority {
    #[default]
    Normal,
    High,
}

/// Per-lead outcome slot in a batch job. Slots are written at the lead's
/// original input index, so the final outcome list always matches input
/// order regardless of worker interleaving.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LeadOutcome {
    Qualified(QualificationResult),
    Failed { code: String, message: String },
    TimedOut,
}

/// Tracks the state of a batch qualification job.
#[derive(Debug, Clone, Serialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub priority: BatchPriority,
    pub total_leads: usize,
    pub processed: usize,
    pub failed: usize,
    /// One slot per input lead, same order. `None` until the lead has run.
    pub outcomes: Vec<Option<LeadOutcome>>,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Workers check this before dequeuing; a lead already in flight runs
    /// to completion to avoid partial persistence.
    #[serde(skip)]
    pub cancel: Arc<AtomicBool>,
}

impl BatchJob {
    pub fn progress_pct(&self) -> f64 {
        if self.total_leads == 0 {
            return 0.0;
        }
        (self.processed + self.failed) as f64 / self.total_leads as f64 * 100.0
    }
}

/// Immediate response to a batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAccepted {
    pub batch_id: Uuid,
    pub total_leads: usize,
    pub status: JobStatus,
}

/// Aggregated status view for `GET /api/v1/batch/:id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub status: JobStatus,
    pub priority: BatchPriority,
    pub total_leads: usize,
    pub processed: usize,
    pub failed: usize,
    pub progress_pct: f64,
    pub tier_breakdown: HashMap<String, usize>,
    pub avg_score: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Batch submission request body.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSubmitRequest {
    pub leads: Vec<LeadInput>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub priority: BatchPriority,
}

/// A registered webhook endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookRegistration {
    pub id: Uuid,
    pub url: String,
    pub events: Vec<String>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

/// Request body for registering a webhook endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRegisterRequest {
    pub url: String,
    pub events: Vec<String>,
    pub secret: String,
}
