//! Webhook ingress: HMAC verification, timestamp window, idempotency and
//! input mapping, plus the engine-owned HTTP surface.

mod api;
mod service;

pub use api::{router, AppState};
pub use service::RunService;

use std::sync::Arc;

use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::info;
use uuid::Uuid;

use crate::error::{ApiError, ErrorCode};
use crate::expr::get_path;
use crate::model::{Run, Step, TriggerType, TriggeredBy};
use crate::queue::JobQueue;
use crate::ratelimit::{LimitScope, RateLimiter};
use crate::storage::{IdempotencyStore, ProjectStore, RunStore};

/// Compute the webhook signature for a timestamp + raw body:
/// lowercase hex of HMAC-SHA256 over `"{timestamp}.{raw_body}"`.
pub fn compute_signature(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison against the `sha256=<hex>` header value.
pub fn verify_signature(secret: &str, timestamp: &str, body: &[u8], header: &str) -> bool {
    let Some(provided) = header.strip_prefix("sha256=") else {
        return false;
    };
    let expected = compute_signature(secret, timestamp, body);
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// The timestamp must parse as unix seconds and lie within +-skew of now.
pub fn check_timestamp(raw: &str, skew_seconds: i64) -> Result<i64, ApiError> {
    let timestamp: i64 = raw
        .parse()
        .map_err(|_| ApiError::unauthorized("invalid webhook timestamp"))?;
    let now = Utc::now().timestamp();
    if (now - timestamp).abs() > skew_seconds {
        return Err(ApiError::unauthorized("webhook timestamp outside allowed window"));
    }
    Ok(timestamp)
}

/// Map logical field names to JSONPath extractions over the raw payload.
/// An empty mapping passes the payload through unchanged.
pub fn apply_input_mapping(mapping: &Value, payload: &Value) -> Value {
    let Some(mapping) = mapping.as_object().filter(|m| !m.is_empty()) else {
        return payload.clone();
    };
    let mut mapped = Map::new();
    for (field, path) in mapping {
        let value = path
            .as_str()
            .and_then(|p| get_path(payload, p))
            .cloned()
            .unwrap_or(Value::Null);
        mapped.insert(field.clone(), value);
    }
    Value::Object(mapped)
}

pub struct WebhookIngress {
    project_store: Arc<dyn ProjectStore>,
    run_store: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
    idempotency: Arc<dyn IdempotencyStore>,
    limiter: Arc<RateLimiter>,
    clock_skew_seconds: i64,
    idempotency_ttl: Duration,
}

#[derive(Debug)]
pub struct IngressAccepted {
    pub run_id: Uuid,
    /// False when an idempotency key resolved to an earlier run.
    pub created: bool,
}

impl WebhookIngress {
    pub fn new(
        project_store: Arc<dyn ProjectStore>,
        run_store: Arc<dyn RunStore>,
        queue: Arc<dyn JobQueue>,
        idempotency: Arc<dyn IdempotencyStore>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            project_store,
            run_store,
            queue,
            idempotency,
            limiter,
            clock_skew_seconds: 300,
            idempotency_ttl: Duration::hours(24),
        }
    }

    pub fn with_clock_skew(mut self, seconds: i64) -> Self {
        self.clock_skew_seconds = seconds;
        self
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    /// Handle `POST /projects/{pid}/webhook/{start_step_id}`.
    pub async fn handle(
        &self,
        project_id: Uuid,
        start_step_id: Uuid,
        signature: Option<&str>,
        timestamp: Option<&str>,
        idempotency_key: Option<&str>,
        body: &[u8],
    ) -> Result<IngressAccepted, ApiError> {
        let project = self
            .project_store
            .get_project(project_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found("project not found"))?;
        let definition = self
            .project_store
            .get_definition(project_id, None)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found("project has no published version"))?;

        let step = definition
            .step(start_step_id)
            .ok_or_else(|| ApiError::not_found("start step not found"))?;
        if step.trigger_type != Some(TriggerType::Webhook) {
            return Err(ApiError::new(
                ErrorCode::ValidationError,
                "step is not a webhook-triggered start step",
            ));
        }
        let trigger_config = step.trigger_config.clone().unwrap_or(Value::Null);
        let secret = trigger_config
            .get("webhook_secret")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ApiError::new(ErrorCode::InternalError, "start step has no webhook secret")
            })?;

        let timestamp =
            timestamp.ok_or_else(|| ApiError::unauthorized("missing webhook timestamp"))?;
        check_timestamp(timestamp, self.clock_skew_seconds)?;

        let signature =
            signature.ok_or_else(|| ApiError::unauthorized("missing webhook signature"))?;
        if !verify_signature(secret, timestamp, body, signature) {
            return Err(ApiError::unauthorized("invalid webhook signature"));
        }

        if let Some(key) = idempotency_key {
            if let Some(existing) = self.idempotency.get(key).await.map_err(ApiError::from)? {
                return Ok(IngressAccepted {
                    run_id: existing,
                    created: false,
                });
            }
        }

        let payload: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        let input = apply_input_mapping(
            trigger_config.get("input_mapping").unwrap_or(&Value::Null),
            &payload,
        );
        validate_trigger_input(step, &input)?;

        let decision = self
            .limiter
            .check(LimitScope::Webhook, &start_step_id.to_string());
        if !decision.allowed {
            let retry_at = decision.retry_at.unwrap_or_else(Utc::now);
            let retry_secs = (retry_at - Utc::now()).num_seconds().max(1);
            return Err(ApiError::new(
                ErrorCode::RateLimitExceeded,
                "webhook rate limit exceeded",
            )
            .with_details(json!({
                "retry_at": retry_at.to_rfc3339(),
                "limit": decision.limit,
                "scope": decision.scope.as_str(),
            }))
            .with_header("Retry-After", retry_secs.to_string()));
        }

        // Reserve the run id under the idempotency key before persisting so
        // a concurrent duplicate resolves to a single run.
        let run_id = Uuid::new_v4();
        if let Some(key) = idempotency_key {
            let owner = self
                .idempotency
                .put_if_absent(key, run_id, self.idempotency_ttl)
                .await
                .map_err(ApiError::from)?;
            if owner != run_id {
                return Ok(IngressAccepted {
                    run_id: owner,
                    created: false,
                });
            }
        }

        let run_number = self
            .run_store
            .next_run_number(project_id, TriggeredBy::Webhook)
            .await
            .map_err(ApiError::from)?;
        let mut run = Run::new(
            project.tenant_id,
            project_id,
            project.version,
            start_step_id,
            run_number,
            TriggeredBy::Webhook,
            input.clone(),
        );
        run.id = run_id;
        self.run_store
            .create_run(run)
            .await
            .map_err(ApiError::from)?;

        let job = crate::model::Job::new(
            project.tenant_id,
            project_id,
            start_step_id,
            run_id,
            TriggeredBy::Webhook,
            input,
        );
        self.queue.enqueue(job).await.map_err(ApiError::from)?;

        info!(%project_id, %start_step_id, %run_id, "webhook accepted");
        Ok(IngressAccepted {
            run_id,
            created: true,
        })
    }
}

fn validate_trigger_input(step: &Step, input: &Value) -> Result<(), ApiError> {
    let Some(schema) = step
        .trigger_config
        .as_ref()
        .and_then(|c| c.get("input_schema"))
        .filter(|s| s.as_object().map(|m| !m.is_empty()).unwrap_or(false))
    else {
        return Ok(());
    };
    let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| {
        ApiError::new(
            ErrorCode::InternalError,
            format!("trigger input_schema does not compile: {e}"),
        )
    })?;
    let validation = compiled.validate(input);
    match validation {
        Ok(()) => Ok(()),
        Err(errs) => {
            let errors: Vec<String> = errs
                .map(|e| format!("{}: {e}", e.instance_path))
                .collect();
            Err(ApiError::new(
                ErrorCode::SchemaValidationError,
                errors.join("; "),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signature_matches_known_vector() {
        // HMAC-SHA256("s3cret", "1704067200.{\"a\":1}")
        let secret = "s3cret";
        let timestamp = "1704067200";
        let body = br#"{"a":1}"#;

        let signature = compute_signature(secret, timestamp, body);
        let header = format!("sha256={signature}");
        assert!(verify_signature(secret, timestamp, body, &header));
    }

    #[test]
    fn test_single_bit_flip_rejected() {
        let secret = "s3cret";
        let timestamp = "1704067200";
        let body = br#"{"a":1}"#;
        let mut signature = compute_signature(secret, timestamp, body).into_bytes();
        // Flip one hex digit.
        signature[0] = if signature[0] == b'0' { b'1' } else { b'0' };
        let header = format!("sha256={}", String::from_utf8(signature).unwrap());
        assert!(!verify_signature(secret, timestamp, body, &header));
    }

    #[test]
    fn test_signature_requires_prefix() {
        let secret = "s3cret";
        let timestamp = "1704067200";
        let body = br#"{"a":1}"#;
        let bare = compute_signature(secret, timestamp, body);
        assert!(!verify_signature(secret, timestamp, body, &bare));
    }

    #[test]
    fn test_timestamp_window_boundaries() {
        let now = Utc::now().timestamp();
        assert!(check_timestamp(&now.to_string(), 300).is_ok());
        assert!(check_timestamp(&(now - 300).to_string(), 300).is_ok());
        assert!(check_timestamp(&(now + 300).to_string(), 300).is_ok());
        assert!(check_timestamp(&(now - 301).to_string(), 300).is_err());
        assert!(check_timestamp(&(now + 301).to_string(), 300).is_err());
        assert!(check_timestamp("not-a-number", 300).is_err());
    }

    #[test]
    fn test_input_mapping_extracts_paths() {
        let mapping = json!({
            "issue_title": "$.issue.title",
            "author": "$.issue.user.login",
            "missing": "$.nope"
        });
        let payload = json!({
            "issue": {"title": "Bug report", "user": {"login": "octocat"}}
        });
        let mapped = apply_input_mapping(&mapping, &payload);
        assert_eq!(mapped["issue_title"], json!("Bug report"));
        assert_eq!(mapped["author"], json!("octocat"));
        assert_eq!(mapped["missing"], Value::Null);
    }

    #[test]
    fn test_empty_mapping_passes_payload_through() {
        let payload = json!({"a": 1});
        assert_eq!(apply_input_mapping(&Value::Null, &payload), payload);
        assert_eq!(apply_input_mapping(&json!({}), &payload), payload);
    }
}
