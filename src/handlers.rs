//! HTTP surface: qualification, batch and webhook-registry endpoints.

use crate::batch::BatchOrchestrator;
use crate::errors::AppError;
use crate::models::{
    BatchSubmitRequest, LeadInput, LeadTier, QualificationResult, WebhookRegisterRequest,
};
use crate::pipeline::LeadQualifier;
use crate::rate_limit::{RateLimiter, Scope};
use crate::storage::PgLeadStore;
use crate::webhooks::WebhookRegistry;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const API_KEY_HEADER: &str = "x-api-key";

/// Shared application state. The store is concretized to Postgres here;
/// tests exercise the generic pipeline and orchestrator directly.
#[derive(Clone)]
pub struct AppState {
    pub qualifier: Arc<LeadQualifier<PgLeadStore>>,
    pub batches: Arc<BatchOrchestrator<LeadQualifier<PgLeadStore>>>,
    pub registry: Arc<WebhookRegistry>,
    pub limiter: Arc<RateLimiter>,
}

/// API routes. `/health` is mounted separately in `main` so deploy probes
/// bypass the ingress rate limiter.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/qualify", post(qualify_lead))
        .route("/api/v1/batch", post(submit_batch))
        .route("/api/v1/batch/:id", get(batch_status).delete(cancel_batch))
        .route("/api/v1/batch/:id/results", get(batch_results))
        .route("/api/v1/webhooks", post(register_webhook).get(list_webhooks))
        .route("/api/v1/webhooks/:id", delete(delete_webhook))
        .with_state(state)
}

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "lead-qualifier-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn caller_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.trim().is_empty())
}

fn with_rate_headers(limiter: &RateLimiter, scope: Scope<'_>, response: Response) -> Response {
    let mut response = response;
    if let Ok(value) = limiter.remaining(scope).to_string().parse() {
        response
            .headers_mut()
            .insert("X-RateLimit-Remaining", value);
    }
    response
}

async fn qualify_lead(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<LeadInput>,
) -> Result<Response, AppError> {
    // Per-caller budget is checked without waiting; the shared provider
    // budget inside the pipeline is the one worth suspending on.
    let scope = match caller_key(&headers) {
        Some(key) => {
            state
                .limiter
                .acquire(Scope::Caller(key), 1, Duration::ZERO)
                .await?;
            Scope::Caller(key)
        }
        None => Scope::Global,
    };

    let result: QualificationResult = state.qualifier.qualify_lead(input).await?;
    let response = (StatusCode::OK, Json(result)).into_response();
    Ok(with_rate_headers(&state.limiter, scope, response))
}

async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchSubmitRequest>,
) -> Result<Response, AppError> {
    let accepted = state
        .batches
        .submit(request.leads, request.webhook_url, request.priority)?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

async fn batch_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let summary = state.batches.status(id)?;
    Ok(Json(summary).into_response())
}

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    tier: Option<String>,
}

async fn batch_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ResultsQuery>,
) -> Result<Response, AppError> {
    let tier = query
        .tier
        .as_deref()
        .map(LeadTier::from_str)
        .transpose()
        .map_err(AppError::Validation)?;
    let outcomes = state.batches.results(id, tier)?;
    Ok(Json(json!({
        "batch_id": id,
        "count": outcomes.len(),
        "results": outcomes,
    }))
    .into_response())
}

async fn cancel_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let summary = state.batches.cancel(id)?;
    Ok(Json(summary).into_response())
}

async fn register_webhook(
    State(state): State<AppState>,
    Json(request): Json<WebhookRegisterRequest>,
) -> Result<Response, AppError> {
    let registration = state.registry.register(request)?;
    Ok((StatusCode::CREATED, Json(registration)).into_response())
}

async fn list_webhooks(State(state): State<AppState>) -> Result<Response, AppError> {
    let endpoints = state.registry.list();
    Ok(Json(json!({
        "count": endpoints.len(),
        "webhooks": endpoints,
    }))
    .into_response())
}

async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    state.registry.delete(id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
