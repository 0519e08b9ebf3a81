//! Outbound event delivery: HMAC-signed webhook dispatch with retries, and
//! the registry of subscriber endpoints.

use crate::errors::AppError;
use crate::models::{WebhookRegisterRequest, WebhookRegistration};
use crate::retry::backoff_delay;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
const EVENT_HEADER: &str = "X-Webhook-Event";
const MAX_ATTEMPTS: u32 = 4;
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

/// Events the registry accepts subscriptions for.
pub const KNOWN_EVENTS: &[&str] = &["lead.qualified", "lead.routed", "batch.completed"];

/// Hex HMAC-SHA256 of the request body, the signature receivers verify.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Terminal state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered { attempts: u32 },
    Failed { attempts: u32 },
}

/// Delivers signed event payloads. Exhausted deliveries are logged and
/// reported in the return value but never propagate as errors; a dead
/// subscriber must not fail the pipeline that emitted the event.
pub struct WebhookDispatcher {
    client: Client,
    retry_base: Duration,
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self::with_retry_base(DEFAULT_RETRY_BASE)
    }

    /// Dispatcher with a custom first retry delay, shortened in tests.
    pub fn with_retry_base(retry_base: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            retry_base,
        }
    }

    /// Delivers one event envelope to `url`, retrying with exponential
    /// backoff on any non-2xx response or transport error.
    pub async fn deliver(
        &self,
        url: &str,
        event: &str,
        data: &Value,
        secret: &str,
    ) -> DeliveryStatus {
        let envelope = json!({
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });
        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to serialize {} payload: {}", event, e);
                return DeliveryStatus::Failed { attempts: 0 };
            }
        };
        let signature = sign_payload(secret, &body);

        for attempt in 0..MAX_ATTEMPTS {
            let outcome = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header(SIGNATURE_HEADER, &signature)
                .header(EVENT_HEADER, event)
                .body(body.clone())
                .send()
                .await;

            match outcome {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(
                        "Delivered {} to {} on attempt {}",
                        event,
                        url,
                        attempt + 1
                    );
                    return DeliveryStatus::Delivered {
                        attempts: attempt + 1,
                    };
                }
                Ok(response) => {
                    tracing::warn!(
                        "{} delivery to {} got status {} (attempt {})",
                        event,
                        url,
                        response.status(),
                        attempt + 1
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "{} delivery to {} failed (attempt {}): {}",
                        event,
                        url,
                        attempt + 1,
                        e
                    );
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(backoff_delay(self.retry_base, attempt)).await;
            }
        }

        tracing::error!(
            "Giving up on {} delivery to {} after {} attempts",
            event,
            url,
            MAX_ATTEMPTS
        );
        DeliveryStatus::Failed {
            attempts: MAX_ATTEMPTS,
        }
    }
}

/// In-process registry of subscriber endpoints.
#[derive(Default)]
pub struct WebhookRegistry {
    endpoints: Mutex<HashMap<Uuid, WebhookRegistration>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        request: WebhookRegisterRequest,
    ) -> Result<WebhookRegistration, AppError> {
        url::Url::parse(&request.url)
            .map_err(|_| AppError::Validation(format!("'{}' is not a valid URL", request.url)))?;
        if request.secret.trim().is_empty() {
            return Err(AppError::Validation(
                "webhook secret cannot be empty".to_string(),
            ));
        }
        if request.events.is_empty() {
            return Err(AppError::Validation(
                "at least one event must be subscribed".to_string(),
            ));
        }
        for event in &request.events {
            if !KNOWN_EVENTS.contains(&event.as_str()) {
                return Err(AppError::Validation(format!(
                    "unknown event '{}', expected one of {}",
                    event,
                    KNOWN_EVENTS.join(", ")
                )));
            }
        }

        let registration = WebhookRegistration {
            id: Uuid::new_v4(),
            url: request.url,
            events: request.events,
            secret: request.secret,
            created_at: Utc::now(),
        };
        self.endpoints
            .lock()
            .expect("webhook registry mutex poisoned")
            .insert(registration.id, registration.clone());
        tracing::info!(
            "Registered webhook {} for events [{}]",
            registration.id,
            registration.events.join(", ")
        );
        Ok(registration)
    }

    pub fn list(&self) -> Vec<WebhookRegistration> {
        let mut all: Vec<_> = self
            .endpoints
            .lock()
            .expect("webhook registry mutex poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|r| r.created_at);
        all
    }

    pub fn delete(&self, id: Uuid) -> Result<(), AppError> {
        self.endpoints
            .lock()
            .expect("webhook registry mutex poisoned")
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("webhook {} not found", id)))
    }

    /// Endpoints subscribed to `event`.
    pub fn subscribers(&self, event: &str) -> Vec<WebhookRegistration> {
        self.endpoints
            .lock()
            .expect("webhook registry mutex poisoned")
            .values()
            .filter(|r| r.events.iter().any(|e| e == event))
            .cloned()
            .collect()
    }
}
