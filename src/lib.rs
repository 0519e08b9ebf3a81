//! Lead Qualification & Routing API Library
//!
//! This library provides the core functionality for the lead qualification
//! service: the scoring model, the qualification pipeline, batch
//! orchestration and outbound webhook delivery.
//!
//! # Modules
//!
//! - `batch`: Batch job orchestration over a bounded worker pool.
//! - `circuit_breaker`: Circuit breaker for the scoring provider.
//! - `config`: Configuration management.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `models`: Core data models.
//! - `pipeline`: The qualification pipeline.
//! - `rate_limit`: Token-bucket budgets for provider and caller traffic.
//! - `retry`: Backoff and transient-error classification helpers.
//! - `scoring`: Weighted scoring model and threshold classification.
//! - `services`: External service clients (enrichment, scoring, CRM).
//! - `storage`: Persistence layer.
//! - `webhooks`: Outbound webhook dispatch and endpoint registry.

pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod scoring;
pub mod services;
pub mod storage;
pub mod webhooks;
