use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Application-specific error types.
///
/// The taxonomy maps one-to-one onto the behaviors callers can act on:
/// validation and configuration errors are never retried, rate limiting
/// carries a retry delay, transient provider errors are retried internally
/// by the pipeline before escalating to `ScoringProvider`.
#[derive(Debug)]
pub enum AppError {
    /// Bad input (malformed email, empty batch). Never retried.
    Validation(String),
    /// A token bucket deadline expired. Caller should retry after the delay.
    RateLimited {
        /// Seconds until the bucket is expected to hold a token again.
        retry_after_secs: u64,
    },
    /// Non-transient scoring provider rejection, or transient errors after
    /// the retry budget was exhausted.
    ScoringProvider(String),
    /// Network failure / timeout / 5xx / 429 from an external call.
    /// Retried inside the pipeline, never surfaced directly to API callers.
    Transient(String),
    /// Invalid weights or threshold table. Fatal at startup, never a
    /// per-request condition.
    Configuration(String),
    /// Database-related errors. Safe to retry the whole request.
    Persistence(sqlx::Error),
    /// Resource not found (unknown batch id, unknown webhook id).
    NotFound(String),
    /// Anything else.
    Internal(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::RateLimited { retry_after_secs } => {
                write!(f, "Rate limit exceeded, retry after {}s", retry_after_secs)
            }
            AppError::ScoringProvider(msg) => write!(f, "Scoring provider error: {}", msg),
            AppError::Transient(msg) => write!(f, "Transient error: {}", msg),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Persistence(e) => write!(f, "Persistence error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl AppError {
    /// Stable machine-readable code used in batch outcome lists and webhook
    /// payloads, where the HTTP status is not available.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            AppError::ScoringProvider(_) => "SCORING_PROVIDER_ERROR",
            AppError::Transient(_) => "TRANSIENT_ERROR",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Persistence(_) => "INTERNAL_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::WithContext { source, .. } => source.code(),
        }
    }
}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Maps each error variant to an appropriate HTTP status code and JSON
    /// body, logging server-side failures at error level.
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::RateLimited { retry_after_secs } => {
                let body = Json(json!({
                    "error": "rate_limit_exceeded",
                    "retry_after": retry_after_secs,
                }));
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after_secs.to_string())],
                    body,
                )
                    .into_response();
            }
            AppError::ScoringProvider(msg) => {
                tracing::error!("Scoring provider error: {}", msg);
                (StatusCode::BAD_GATEWAY, "Scoring provider error".to_string())
            }
            AppError::Transient(msg) => {
                tracing::error!("Unretried transient error surfaced: {}", msg);
                (StatusCode::BAD_GATEWAY, "Upstream service error".to_string())
            }
            AppError::Configuration(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Configuration error".to_string(),
                )
            }
            AppError::Persistence(e) => {
                tracing::error!("Persistence error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return (*source).into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Persistence(err)
    }
}

impl From<reqwest::Error> for AppError {
    /// Network-level reqwest failures are transient by definition; status
    /// code classification happens at the call sites that see a response.
    fn from(err: reqwest::Error) -> Self {
        AppError::Transient(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }
}

impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::Persistence(e)),
            context: context.into(),
        })
    }
}
