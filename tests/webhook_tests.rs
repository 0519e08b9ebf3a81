//! Webhook delivery tests: signatures, retry behavior, exhaustion.

use lead_qualifier_api::webhooks::{sign_payload, DeliveryStatus, WebhookDispatcher};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dispatcher() -> WebhookDispatcher {
    WebhookDispatcher::with_retry_base(Duration::from_millis(10))
}

#[tokio::test]
async fn delivery_carries_a_verifiable_signature() {
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&receiver)
        .await;

    let status = dispatcher()
        .deliver(
            &receiver.uri(),
            "lead.qualified",
            &json!({"score": 84, "tier": "HOT"}),
            "endpoint-secret",
        )
        .await;
    assert_eq!(status, DeliveryStatus::Delivered { attempts: 1 });

    let request = &receiver.received_requests().await.unwrap()[0];
    let signature = request
        .headers
        .get("X-Webhook-Signature")
        .unwrap()
        .to_str()
        .unwrap();
    // The receiver recomputes the HMAC over the exact body bytes.
    assert_eq!(signature, sign_payload("endpoint-secret", &request.body));
    // A different secret would not verify.
    assert_ne!(signature, sign_payload("wrong-secret", &request.body));

    let envelope: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(envelope["event"], "lead.qualified");
    assert_eq!(envelope["data"]["score"], 84);
    assert!(envelope["timestamp"].is_string());
}

#[tokio::test]
async fn failed_delivery_is_retried_until_success() {
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&receiver)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&receiver)
        .await;

    let status = dispatcher()
        .deliver(&receiver.uri(), "lead.routed", &json!({}), "s")
        .await;
    assert_eq!(status, DeliveryStatus::Delivered { attempts: 3 });
}

#[tokio::test]
async fn exhausted_delivery_reports_failure_without_erroring() {
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&receiver)
        .await;

    let status = dispatcher()
        .deliver(&receiver.uri(), "batch.completed", &json!({}), "s")
        .await;
    assert_eq!(status, DeliveryStatus::Failed { attempts: 4 });
}

#[tokio::test]
async fn unreachable_endpoint_fails_after_all_attempts() {
    // Nothing listens on this port.
    let status = dispatcher()
        .deliver(
            "http://127.0.0.1:1/hook",
            "batch.completed",
            &json!({}),
            "s",
        )
        .await;
    assert_eq!(status, DeliveryStatus::Failed { attempts: 4 });
}
