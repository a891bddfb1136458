//! Usage-metering decorators over LLM and HTTP capabilities.
//!
//! Usage records are written per capability call, attributed to the step run
//! that made them. The step executor wraps the base capabilities with these
//! before building the per-step sandbox services.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::sandbox::{
    CapabilityError, HttpCapability, HttpRequest, HttpResponse, LlmCapability, LlmResponse,
};
use crate::storage::{UsageRecord, UsageSink};

#[derive(Clone, Copy)]
pub(crate) struct UsageScope {
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
}

pub(crate) struct MeteredLlm {
    pub inner: Arc<dyn LlmCapability>,
    pub sink: Arc<dyn UsageSink>,
    pub scope: UsageScope,
}

impl MeteredLlm {
    async fn record(&self, provider: &str, model: &str, response: &LlmResponse) {
        let tokens = response
            .usage
            .get("total_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let _ = self
            .sink
            .record(UsageRecord {
                tenant_id: self.scope.tenant_id,
                run_id: self.scope.run_id,
                step_id: self.scope.step_id,
                kind: "llm_tokens".into(),
                quantity: tokens,
                detail: json!({"provider": provider, "model": model, "usage": response.usage}),
                at: Utc::now(),
            })
            .await;
    }
}

#[async_trait]
impl LlmCapability for MeteredLlm {
    async fn chat(
        &self,
        provider: &str,
        model: &str,
        request: Value,
    ) -> Result<LlmResponse, CapabilityError> {
        let response = self.inner.chat(provider, model, request).await?;
        self.record(provider, model, &response).await;
        Ok(response)
    }

    async fn complete(
        &self,
        provider: &str,
        model: &str,
        request: Value,
    ) -> Result<LlmResponse, CapabilityError> {
        let response = self.inner.complete(provider, model, request).await?;
        self.record(provider, model, &response).await;
        Ok(response)
    }
}

pub(crate) struct MeteredHttp {
    pub inner: Arc<dyn HttpCapability>,
    pub sink: Arc<dyn UsageSink>,
    pub scope: UsageScope,
}

#[async_trait]
impl HttpCapability for MeteredHttp {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError> {
        let method = request.method.clone();
        let url = request.url.clone();
        let response = self.inner.request(request).await?;
        let _ = self
            .sink
            .record(UsageRecord {
                tenant_id: self.scope.tenant_id,
                run_id: self.scope.run_id,
                step_id: self.scope.step_id,
                kind: "http_call".into(),
                quantity: 1,
                detail: json!({"method": method, "url": url, "status": response.status}),
                at: Utc::now(),
            })
            .await;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::collections::HashMap;

    struct FixedLlm;

    #[async_trait]
    impl LlmCapability for FixedLlm {
        async fn chat(&self, _: &str, _: &str, _: Value) -> Result<LlmResponse, CapabilityError> {
            Ok(LlmResponse {
                content: "hi".into(),
                usage: json!({"total_tokens": 17}),
            })
        }

        async fn complete(&self, _: &str, _: &str, _: Value) -> Result<LlmResponse, CapabilityError> {
            Ok(LlmResponse {
                content: "hi".into(),
                usage: json!({}),
            })
        }
    }

    struct FixedHttp;

    #[async_trait]
    impl HttpCapability for FixedHttp {
        async fn request(&self, _: HttpRequest) -> Result<HttpResponse, CapabilityError> {
            Ok(HttpResponse {
                status: 201,
                status_text: "Created".into(),
                headers: HashMap::new(),
                body: Value::Null,
            })
        }
    }

    fn scope() -> UsageScope {
        UsageScope {
            tenant_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_llm_usage_recorded() {
        let store = Arc::new(MemoryStore::new());
        let metered = MeteredLlm {
            inner: Arc::new(FixedLlm),
            sink: store.clone(),
            scope: scope(),
        };
        metered.chat("openai", "gpt-4o", json!({})).await.unwrap();

        let records = store.usage_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "llm_tokens");
        assert_eq!(records[0].quantity, 17);
    }

    #[tokio::test]
    async fn test_http_usage_recorded() {
        let store = Arc::new(MemoryStore::new());
        let metered = MeteredHttp {
            inner: Arc::new(FixedHttp),
            sink: store.clone(),
            scope: scope(),
        };
        metered
            .request(HttpRequest {
                method: "POST".into(),
                url: "https://api.example.com/items".into(),
                headers: HashMap::new(),
                body: None,
                timeout_ms: None,
            })
            .await
            .unwrap();

        let records = store.usage_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "http_call");
        assert_eq!(records[0].detail["status"], json!(201));
    }
}
