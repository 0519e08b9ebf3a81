//! Batch qualification: a fixed worker pool drains submitted leads through
//! the pipeline, recording each outcome at the lead's original input index.

use crate::errors::AppError;
use crate::models::{
    BatchAccepted, BatchJob, BatchPriority, BatchSummary, JobStatus, LeadInput, LeadOutcome,
    LeadTier,
};
use crate::pipeline::Qualify;
use crate::webhooks::{WebhookDispatcher, WebhookRegistry};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Orchestrates batch jobs over a shared pipeline.
///
/// Jobs live in memory for the life of the process; the original system
/// treats batch state as ephemeral and callers re-submit after a restart.
pub struct BatchOrchestrator<Q: Qualify> {
    qualifier: Arc<Q>,
    jobs: Arc<Mutex<HashMap<Uuid, BatchJob>>>,
    dispatcher: Arc<WebhookDispatcher>,
    registry: Arc<WebhookRegistry>,
    signing_secret: String,
    workers: usize,
    lead_deadline: Duration,
}

impl<Q: Qualify> BatchOrchestrator<Q> {
    pub fn new(
        qualifier: Arc<Q>,
        dispatcher: Arc<WebhookDispatcher>,
        registry: Arc<WebhookRegistry>,
        signing_secret: String,
        workers: usize,
        lead_deadline: Duration,
    ) -> Self {
        Self {
            qualifier,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            dispatcher,
            registry,
            signing_secret,
            workers: workers.max(1),
            lead_deadline,
        }
    }

    /// Accepts a batch, spawns its workers and returns immediately.
    ///
    /// Rejects empty batches and malformed completion URLs before any job
    /// state is created.
    pub fn submit(
        &self,
        leads: Vec<LeadInput>,
        webhook_url: Option<String>,
        priority: BatchPriority,
    ) -> Result<BatchAccepted, AppError> {
        if leads.is_empty() {
            return Err(AppError::Validation(
                "batch must contain at least one lead".to_string(),
            ));
        }
        if let Some(ref url) = webhook_url {
            url::Url::parse(url).map_err(|_| {
                AppError::Validation(format!("'{}' is not a valid webhook URL", url))
            })?;
        }

        let job = BatchJob {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            priority,
            total_leads: leads.len(),
            processed: 0,
            failed: 0,
            outcomes: vec![None; leads.len()],
            webhook_url,
            created_at: Utc::now(),
            completed_at: None,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let accepted = BatchAccepted {
            batch_id: job.id,
            total_leads: job.total_leads,
            status: job.status,
        };

        let cancel = job.cancel.clone();
        self.jobs
            .lock()
            .expect("job map mutex poisoned")
            .insert(job.id, job);

        tracing::info!(
            "Accepted batch {} with {} leads ({} workers)",
            accepted.batch_id,
            accepted.total_leads,
            self.workers
        );
        self.spawn_job(accepted.batch_id, leads, cancel);

        Ok(accepted)
    }

    fn spawn_job(&self, job_id: Uuid, leads: Vec<LeadInput>, cancel: Arc<AtomicBool>) {
        let qualifier = self.qualifier.clone();
        let jobs = self.jobs.clone();
        let dispatcher = self.dispatcher.clone();
        let registry = self.registry.clone();
        let signing_secret = self.signing_secret.clone();
        let workers = self.workers;
        let lead_deadline = self.lead_deadline;

        tokio::spawn(async move {
            {
                let mut map = jobs.lock().expect("job map mutex poisoned");
                if let Some(job) = map.get_mut(&job_id) {
                    job.status = JobStatus::Processing;
                }
            }

            let (tx, rx) = tokio::sync::mpsc::channel::<(usize, LeadInput)>(workers * 2);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));

            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let qualifier = qualifier.clone();
                let jobs = jobs.clone();
                let rx = rx.clone();
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        // Receiver lock is held only across recv so workers
                        // never serialize on each other's pipeline calls.
                        let next = { rx.lock().await.recv().await };
                        let Some((index, lead)) = next else { break };

                        // A cancelled job stops dequeuing; the in-flight
                        // lead of each worker already ran to completion.
                        if cancel.load(Ordering::SeqCst) {
                            break;
                        }

                        let outcome =
                            match tokio::time::timeout(lead_deadline, qualifier.qualify(lead))
                                .await
                            {
                                Ok(Ok(result)) => LeadOutcome::Qualified(result),
                                Ok(Err(e)) => LeadOutcome::Failed {
                                    code: e.code().to_string(),
                                    message: e.to_string(),
                                },
                                Err(_) => LeadOutcome::TimedOut,
                            };

                        let mut map = jobs.lock().expect("job map mutex poisoned");
                        if let Some(job) = map.get_mut(&job_id) {
                            match outcome {
                                LeadOutcome::Qualified(_) => job.processed += 1,
                                _ => job.failed += 1,
                            }
                            job.outcomes[index] = Some(outcome);
                        }
                    }
                }));
            }

            for (index, lead) in leads.into_iter().enumerate() {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                if tx.send((index, lead)).await.is_err() {
                    break;
                }
            }
            drop(tx);

            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!("Batch {} worker panicked: {}", job_id, e);
                }
            }

            let summary = {
                let mut map = jobs.lock().expect("job map mutex poisoned");
                let Some(job) = map.get_mut(&job_id) else { return };
                job.status = if cancel.load(Ordering::SeqCst)
                    && job.processed + job.failed < job.total_leads
                {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Completed
                };
                job.completed_at = Some(Utc::now());
                tracing::info!(
                    "Batch {} finished as {:?}: {} processed, {} failed of {}",
                    job_id,
                    job.status,
                    job.processed,
                    job.failed,
                    job.total_leads
                );
                summarize(job)
            };

            if summary.status != JobStatus::Completed {
                return;
            }

            let payload = json!(summary);
            let completion_url = {
                let map = jobs.lock().expect("job map mutex poisoned");
                map.get(&job_id).and_then(|j| j.webhook_url.clone())
            };
            if let Some(url) = completion_url {
                dispatcher
                    .deliver(&url, "batch.completed", &payload, &signing_secret)
                    .await;
            }
            for subscriber in registry.subscribers("batch.completed") {
                dispatcher
                    .deliver(
                        &subscriber.url,
                        "batch.completed",
                        &payload,
                        &subscriber.secret,
                    )
                    .await;
            }
        });
    }

    /// Aggregated view for the status endpoint.
    pub fn status(&self, job_id: Uuid) -> Result<BatchSummary, AppError> {
        let map = self.jobs.lock().expect("job map mutex poisoned");
        map.get(&job_id)
            .map(summarize)
            .ok_or_else(|| AppError::NotFound(format!("batch {} not found", job_id)))
    }

    /// Per-lead outcomes in input order, optionally filtered by tier.
    pub fn results(
        &self,
        job_id: Uuid,
        tier: Option<LeadTier>,
    ) -> Result<Vec<LeadOutcome>, AppError> {
        let map = self.jobs.lock().expect("job map mutex poisoned");
        let job = map
            .get(&job_id)
            .ok_or_else(|| AppError::NotFound(format!("batch {} not found", job_id)))?;
        Ok(job
            .outcomes
            .iter()
            .flatten()
            .filter(|outcome| match (tier, outcome) {
                (None, _) => true,
                (Some(t), LeadOutcome::Qualified(result)) => result.tier == t,
                (Some(_), _) => false,
            })
            .cloned()
            .collect())
    }

    /// Requests cancellation. Leads already in flight finish; queued leads
    /// are never started.
    pub fn cancel(&self, job_id: Uuid) -> Result<BatchSummary, AppError> {
        let map = self.jobs.lock().expect("job map mutex poisoned");
        let job = map
            .get(&job_id)
            .ok_or_else(|| AppError::NotFound(format!("batch {} not found", job_id)))?;
        match job.status {
            JobStatus::Queued | JobStatus::Processing => {
                job.cancel.store(true, Ordering::SeqCst);
                tracing::info!("Cancellation requested for batch {}", job_id);
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "batch {} already finished",
                    job_id
                )))
            }
        }
        Ok(summarize(job))
    }
}

fn summarize(job: &BatchJob) -> BatchSummary {
    let mut tier_breakdown: HashMap<String, usize> = HashMap::new();
    let mut score_sum: u64 = 0;
    let mut scored: usize = 0;
    for outcome in job.outcomes.iter().flatten() {
        if let LeadOutcome::Qualified(result) = outcome {
            *tier_breakdown
                .entry(result.tier.as_str().to_string())
                .or_insert(0) += 1;
            score_sum += result.score as u64;
            scored += 1;
        }
    }
    let avg_score = if scored > 0 {
        score_sum as f64 / scored as f64
    } else {
        0.0
    };

    BatchSummary {
        batch_id: job.id,
        status: job.status,
        priority: job.priority,
        total_leads: job.total_leads,
        processed: job.processed,
        failed: job.failed,
        progress_pct: job.progress_pct(),
        tier_breakdown,
        avg_score,
        created_at: job.created_at,
        completed_at: job.completed_at,
    }
}
