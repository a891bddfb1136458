//! Webhook ingress end to end: signature, idempotency, rate limit, run.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use common::{assert_completed, Harness};
use conflux::error::ErrorCode;
use conflux::model::{Edge, ProjectDefinition, Step, StepType, TriggerType};
use conflux::queue::JobQueue;
use conflux::ratelimit::{RateLimitConfig, RateLimiter};
use conflux::webhook::{compute_signature, WebhookIngress};

struct WebhookWorld {
    harness: Harness,
    ingress: WebhookIngress,
    project_id: Uuid,
    start_step_id: Uuid,
}

async fn world(webhook_per_minute: u32) -> WebhookWorld {
    let harness = Harness::new();
    let project_id = Uuid::new_v4();

    let mut start = Step::start(project_id, "hook", TriggerType::Webhook);
    start.trigger_config = Some(json!({
        "webhook_secret": "s3cret",
        "input_mapping": {
            "a": "$.a",
            "label": "$.meta.label"
        }
    }));
    let echo = Step::new(project_id, "echo", StepType::Code)
        .with_config(json!({"code": "return { got: input.a, label: input.label };"}));

    let edges = vec![Edge::new(project_id, start.id, echo.id)];
    let start_step_id = start.id;
    let definition = ProjectDefinition {
        steps: vec![start, echo],
        edges,
        groups: vec![],
        variables: HashMap::new(),
    };
    let project = harness.publish(definition).await;

    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        enabled: true,
        tenant_per_minute: 1000,
        project_per_minute: 1000,
        webhook_per_minute,
    }));
    let ingress = WebhookIngress::new(
        harness.store.clone(),
        harness.store.clone(),
        harness.queue.clone(),
        harness.store.clone(),
        limiter,
    );

    WebhookWorld {
        harness,
        ingress,
        project_id: project.id,
        start_step_id,
    }
}

fn signed(body: &[u8]) -> (String, String) {
    let timestamp = Utc::now().timestamp().to_string();
    let signature = format!("sha256={}", compute_signature("s3cret", &timestamp, body));
    (timestamp, signature)
}

#[tokio::test(flavor = "multi_thread")]
async fn valid_signature_enqueues_pending_run() {
    let world = world(60).await;
    let body = br#"{"a":1,"meta":{"label":"hello"}}"#;
    let (timestamp, signature) = signed(body);

    let accepted = world
        .ingress
        .handle(
            world.project_id,
            world.start_step_id,
            Some(&signature),
            Some(&timestamp),
            None,
            body,
        )
        .await
        .unwrap();
    assert!(accepted.created);

    // The mapped input flows through the run.
    let run = world.harness.pump_until_terminal(accepted.run_id).await;
    assert_completed(&run);
    assert_eq!(run.input, json!({"a": 1, "label": "hello"}));
    let output = run.output.unwrap();
    assert_eq!(output["echo"], json!({"got": 1, "label": "hello"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn tampered_signature_rejected() {
    let world = world(60).await;
    let body = br#"{"a":1}"#;
    let (timestamp, signature) = signed(body);

    // Flip one bit of the hex signature.
    let mut bad = signature.into_bytes();
    let last = bad.len() - 1;
    bad[last] = if bad[last] == b'0' { b'1' } else { b'0' };
    let bad = String::from_utf8(bad).unwrap();

    let err = world
        .ingress
        .handle(
            world.project_id,
            world.start_step_id,
            Some(&bad),
            Some(&timestamp),
            None,
            body,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_timestamp_rejected() {
    let world = world(60).await;
    let body = br#"{"a":1}"#;
    let timestamp = (Utc::now().timestamp() - 301).to_string();
    let signature = format!("sha256={}", compute_signature("s3cret", &timestamp, body));

    let err = world
        .ingress
        .handle(
            world.project_id,
            world.start_step_id,
            Some(&signature),
            Some(&timestamp),
            None,
            body,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_idempotency_key_returns_same_run() {
    let world = world(60).await;
    let body = br#"{"a":2}"#;
    let (timestamp, signature) = signed(body);

    let first = world
        .ingress
        .handle(
            world.project_id,
            world.start_step_id,
            Some(&signature),
            Some(&timestamp),
            Some("delivery-42"),
            body,
        )
        .await
        .unwrap();
    assert!(first.created);

    let second = world
        .ingress
        .handle(
            world.project_id,
            world.start_step_id,
            Some(&signature),
            Some(&timestamp),
            Some("delivery-42"),
            body,
        )
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(first.run_id, second.run_id);

    // Only one job reached the queue.
    assert_eq!(world.harness.queue.pending_len().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn webhook_rate_limit_returns_retry_hint() {
    let world = world(2).await;
    let body = br#"{"a":3}"#;
    let (timestamp, signature) = signed(body);

    for _ in 0..2 {
        world
            .ingress
            .handle(
                world.project_id,
                world.start_step_id,
                Some(&signature),
                Some(&timestamp),
                None,
                body,
            )
            .await
            .unwrap();
    }

    let err = world
        .ingress
        .handle(
            world.project_id,
            world.start_step_id,
            Some(&signature),
            Some(&timestamp),
            None,
            body,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimitExceeded);
    assert!(err
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("retry-after")));
    let details = err.details.unwrap();
    assert_eq!(details["scope"], json!("webhook"));
    assert_eq!(details["limit"], json!(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn non_webhook_start_step_rejected() {
    let harness = Harness::new();
    let project_id = Uuid::new_v4();
    let start = Step::start(project_id, "manual-start", TriggerType::Manual);
    let start_id = start.id;
    let project = harness
        .publish(ProjectDefinition {
            steps: vec![start],
            edges: vec![],
            groups: vec![],
            variables: HashMap::new(),
        })
        .await;

    let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
    let ingress = WebhookIngress::new(
        harness.store.clone(),
        harness.store.clone(),
        harness.queue.clone(),
        harness.store.clone(),
        limiter,
    );

    let body = br#"{}"#;
    let (timestamp, signature) = signed(body);
    let err = ingress
        .handle(project.id, start_id, Some(&signature), Some(&timestamp), None, body)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
}
