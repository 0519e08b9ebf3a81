//! Persistence seam for leads and their owned records.
//!
//! The pipeline only requires one guarantee from storage: the lead update
//! and its new scoring-audit row are written atomically (both or neither).
//! `PgLeadStore` gets that from a transaction with `SELECT ... FOR UPDATE`;
//! `MemoryLeadStore` backs tests and relies on the pipeline's per-lead
//! serialization.

use crate::errors::{AppError, ResultExt};
use crate::models::{
    EnrichmentData, EnrichmentRecord, EnrichmentSource, Lead, LeadInput, LeadSource, LeadStatus,
    LeadTier, RoutingAction, RoutingRecord, ScoringAudit, SubScores,
};
use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Mutex;
use uuid::Uuid;

/// Enrichment snapshot to append alongside a qualification write.
#[derive(Debug, Clone)]
pub struct NewEnrichment {
    pub source: EnrichmentSource,
    pub data: EnrichmentData,
    pub raw: Value,
}

/// Everything one qualification run writes in a single unit of work.
#[derive(Debug, Clone)]
pub struct NewQualification {
    pub score: i32,
    pub tier: LeadTier,
    pub action: RoutingAction,
    pub reasoning: String,
    pub status: LeadStatus,
    pub model_version: String,
    pub sub_scores: SubScores,
    pub tokens_used: i64,
    pub latency_ms: i64,
    pub retries: i32,
    pub raw_response: Value,
    pub enrichment: Option<NewEnrichment>,
}

/// Storage operations the pipeline depends on.
pub trait LeadStore: Send + Sync + 'static {
    /// Upserts the lead by email and appends the audit (and enrichment)
    /// rows atomically. Returns the stored lead.
    fn record_qualification(
        &self,
        input: &LeadInput,
        qualification: &NewQualification,
    ) -> impl Future<Output = Result<Lead, AppError>> + Send;

    /// Appends a routing record and moves the lead's status, used by the
    /// post-commit side-effect step.
    fn record_routing(
        &self,
        record: &RoutingRecord,
        lead_status: LeadStatus,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// sqlx/Postgres-backed store.
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl LeadStore for PgLeadStore {
    async fn record_qualification(
        &self,
        input: &LeadInput,
        q: &NewQualification,
    ) -> Result<Lead, AppError> {
        let email = input.email.to_lowercase();
        let now = Utc::now();
        let metadata = serde_json::to_value(&input.metadata)
            .map_err(|e| AppError::Internal(format!("Failed to serialize metadata: {}", e)))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to open qualification transaction")?;

        // Row lock serializes concurrent re-qualifications of the same lead
        // so audit rows never interleave with lead updates.
        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM leads WHERE email = $1 FOR UPDATE")
                .bind(&email)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to look up lead by email")?;

        let lead_id = match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE leads
                    SET score = $2, tier = $3, status = $4, reasoning = $5,
                        recommended_action = $6, qualified_at = $7, updated_at = $7
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(q.score)
                .bind(q.tier.as_str())
                .bind(q.status.as_str())
                .bind(&q.reasoning)
                .bind(q.action.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("Failed to update lead")?;
                id
            }
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r#"
                    INSERT INTO leads
                        (id, email, company, full_name, message, source, metadata,
                         score, tier, status, reasoning, recommended_action,
                         created_at, updated_at, qualified_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13, $13)
                    "#,
                )
                .bind(id)
                .bind(&email)
                .bind(&input.company)
                .bind(&input.name)
                .bind(&input.message)
                .bind(
                    serde_json::to_value(input.source)
                        .ok()
                        .and_then(|v| v.as_str().map(String::from))
                        .unwrap_or_else(|| "api".to_string()),
                )
                .bind(&metadata)
                .bind(q.score)
                .bind(q.tier.as_str())
                .bind(q.status.as_str())
                .bind(&q.reasoning)
                .bind(q.action.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("Failed to insert lead")?;
                id
            }
        };

        sqlx::query(
            r#"
            INSERT INTO scoring_audits
                (id, lead_id, model_version, company_fit, intent_signal,
                 budget_indicator, urgency, final_score, tokens_used,
                 latency_ms, retries, raw_response, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(lead_id)
        .bind(&q.model_version)
        .bind(q.sub_scores.company_fit)
        .bind(q.sub_scores.intent_signal)
        .bind(q.sub_scores.budget_indicator)
        .bind(q.sub_scores.urgency)
        .bind(q.score)
        .bind(q.tokens_used)
        .bind(q.latency_ms)
        .bind(q.retries)
        .bind(&q.raw_response)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to insert scoring audit")?;

        if let Some(ref enrichment) = q.enrichment {
            sqlx::query(
                r#"
                INSERT INTO enrichment_records
                    (id, lead_id, source, data, raw, fetched_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(lead_id)
            .bind(
                serde_json::to_value(enrichment.source)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| "api".to_string()),
            )
            .bind(
                serde_json::to_value(&enrichment.data).map_err(|e| {
                    AppError::Internal(format!("Failed to serialize enrichment: {}", e))
                })?,
            )
            .bind(&enrichment.raw)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert enrichment record")?;
        }

        let row = sqlx::query("SELECT * FROM leads WHERE id = $1")
            .bind(lead_id)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to re-read lead")?;

        tx.commit()
            .await
            .context("Failed to commit qualification transaction")?;

        lead_from_row(&row)
    }

    async fn record_routing(
        &self,
        record: &RoutingRecord,
        lead_status: LeadStatus,
    ) -> Result<(), AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to open routing transaction")?;

        sqlx::query(
            r#"
            INSERT INTO routing_records
                (id, lead_id, assignee, reason, notification_sent,
                 crm_synced, crm_remote_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.lead_id)
        .bind(&record.assignee)
        .bind(&record.reason)
        .bind(record.notification_sent)
        .bind(record.crm_synced)
        .bind(&record.crm_remote_id)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert routing record")?;

        sqlx::query(
            r#"
            UPDATE leads
            SET status = $2, routed_at = $3, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(record.lead_id)
        .bind(lead_status.as_str())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to update lead routing status")?;

        tx.commit()
            .await
            .context("Failed to commit routing transaction")?;
        Ok(())
    }
}

fn lead_from_row(row: &sqlx::postgres::PgRow) -> Result<Lead, AppError> {
    let status: String = row.try_get("status")?;
    let tier: Option<String> = row.try_get("tier")?;
    let action: Option<String> = row.try_get("recommended_action")?;
    let source: String = row.try_get("source")?;

    Ok(Lead {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        company: row.try_get("company")?,
        full_name: row.try_get("full_name")?,
        message: row.try_get("message")?,
        source: serde_json::from_value(Value::String(source)).unwrap_or(LeadSource::Api),
        metadata: row.try_get("metadata")?,
        score: row.try_get("score")?,
        tier: tier.as_deref().and_then(|t| LeadTier::from_str(t).ok()),
        status: LeadStatus::from_str(&status)
            .map_err(|e| AppError::Internal(format!("Corrupt lead row: {}", e)))?,
        reasoning: row.try_get("reasoning")?,
        recommended_action: action
            .as_deref()
            .and_then(|a| serde_json::from_value(Value::String(a.to_string())).ok()),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        qualified_at: row.try_get("qualified_at")?,
        routed_at: row.try_get("routed_at")?,
    })
}

/// Stored state for one lead in the in-memory store.
#[derive(Debug, Clone)]
pub struct StoredLead {
    pub lead: Lead,
    /// Bumped on every lead update; audits remember the version they were
    /// computed against so tests can assert serialized writes.
    pub version: u64,
    pub audits: Vec<(u64, ScoringAudit)>,
    pub enrichments: Vec<EnrichmentRecord>,
    pub routings: Vec<RoutingRecord>,
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryLeadStore {
    leads: Mutex<HashMap<String, StoredLead>>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lead(&self, email: &str) -> Option<StoredLead> {
        self.leads
            .lock()
            .expect("lead map mutex poisoned")
            .get(&email.to_lowercase())
            .cloned()
    }

    pub fn lead_count(&self) -> usize {
        self.leads.lock().expect("lead map mutex poisoned").len()
    }
}

impl LeadStore for MemoryLeadStore {
    async fn record_qualification(
        &self,
        input: &LeadInput,
        q: &NewQualification,
    ) -> Result<Lead, AppError> {
        let email = input.email.to_lowercase();
        let now = Utc::now();

        // Snapshot phase: read the version the audit will reference.
        let (lead_id, snapshot_version) = {
            let leads = self.leads.lock().expect("lead map mutex poisoned");
            match leads.get(&email) {
                Some(stored) => (stored.lead.id, stored.version),
                None => (Uuid::new_v4(), 0),
            }
        };

        // Deliberate suspension point between read and write: interleaved
        // callers would observe a stale snapshot version here, which the
        // pipeline's per-lead lock must prevent.
        tokio::task::yield_now().await;

        let mut leads = self.leads.lock().expect("lead map mutex poisoned");
        let stored = leads.entry(email.clone()).or_insert_with(|| StoredLead {
            lead: Lead {
                id: lead_id,
                email: email.clone(),
                company: input.company.clone(),
                full_name: input.name.clone(),
                message: input.message.clone(),
                source: input.source,
                metadata: serde_json::to_value(&input.metadata).unwrap_or(Value::Null),
                score: None,
                tier: None,
                status: LeadStatus::New,
                reasoning: None,
                recommended_action: None,
                created_at: now,
                updated_at: now,
                qualified_at: None,
                routed_at: None,
            },
            version: 0,
            audits: Vec::new(),
            enrichments: Vec::new(),
            routings: Vec::new(),
        });

        if stored.version != snapshot_version {
            // A concurrent write slipped in between snapshot and commit.
            return Err(AppError::Internal(format!(
                "interleaved qualification write for {} (snapshot v{}, current v{})",
                email, snapshot_version, stored.version
            )));
        }

        stored.lead.score = Some(q.score);
        stored.lead.tier = Some(q.tier);
        stored.lead.status = q.status;
        stored.lead.reasoning = Some(q.reasoning.clone());
        stored.lead.recommended_action = Some(q.action);
        stored.lead.qualified_at = Some(now);
        stored.lead.updated_at = now;
        stored.version += 1;

        stored.audits.push((
            snapshot_version,
            ScoringAudit {
                id: Uuid::new_v4(),
                lead_id: stored.lead.id,
                model_version: q.model_version.clone(),
                sub_scores: q.sub_scores,
                final_score: q.score,
                tokens_used: q.tokens_used,
                latency_ms: q.latency_ms,
                retries: q.retries,
                raw_response: q.raw_response.clone(),
                created_at: now,
            },
        ));

        if let Some(ref enrichment) = q.enrichment {
            stored.enrichments.push(EnrichmentRecord {
                id: Uuid::new_v4(),
                lead_id: stored.lead.id,
                source: enrichment.source,
                data: enrichment.data.clone(),
                raw: enrichment.raw.clone(),
                fetched_at: now,
            });
        }

        Ok(stored.lead.clone())
    }

    async fn record_routing(
        &self,
        record: &RoutingRecord,
        lead_status: LeadStatus,
    ) -> Result<(), AppError> {
        let mut leads = self.leads.lock().expect("lead map mutex poisoned");
        let stored = leads
            .values_mut()
            .find(|s| s.lead.id == record.lead_id)
            .ok_or_else(|| AppError::NotFound(format!("lead {} not found", record.lead_id)))?;
        stored.routings.push(record.clone());
        stored.lead.status = lead_status;
        stored.lead.routed_at = Some(record.created_at);
        stored.lead.updated_at = record.created_at;
        stored.version += 1;
        Ok(())
    }
}
