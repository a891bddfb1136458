//! Capability traits bound into the sandbox `ctx` object.
//!
//! Every power exposed to block code goes through one of these traits; the
//! interpreter has no other way to reach the host. Implementations are
//! injected at startup, no-op stand-ins back tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// Error surfaced to JS as a thrown `[CODE] message` error so block
/// `error_codes` classification applies.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct CapabilityError {
    pub code: String,
    pub message: String,
}

impl CapabilityError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("SYS_001", message)
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout_ms: Option<u64>,
}

/// Response shape surfaced to JS: `{status, statusText, headers, body}`.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl HttpResponse {
    pub fn to_value(&self) -> Value {
        json!({
            "status": self.status,
            "statusText": self.status_text,
            "headers": self.headers,
            "body": self.body,
        })
    }
}

#[async_trait]
pub trait HttpCapability: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError>;
}

/// LLM call result: `{content, usage}`.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Value,
}

impl LlmResponse {
    pub fn to_value(&self) -> Value {
        json!({ "content": self.content, "usage": self.usage })
    }
}

#[async_trait]
pub trait LlmCapability: Send + Sync {
    async fn chat(
        &self,
        provider: &str,
        model: &str,
        request: Value,
    ) -> Result<LlmResponse, CapabilityError>;

    async fn complete(
        &self,
        provider: &str,
        model: &str,
        request: Value,
    ) -> Result<LlmResponse, CapabilityError>;
}

#[async_trait]
pub trait WorkflowCapability: Send + Sync {
    /// Run another project and return its output. `start_step_id` must be
    /// given when the target project has more than one start step.
    async fn run(
        &self,
        project_id: Uuid,
        start_step_id: Option<Uuid>,
        input: Value,
    ) -> Result<Value, CapabilityError>;
}

#[async_trait]
pub trait HumanCapability: Send + Sync {
    /// Suspend the enclosing step run until a human responds. The returned
    /// value is the approval result observed after resumption.
    async fn request_approval(&self, request: Value) -> Result<Value, CapabilityError>;
}

#[async_trait]
pub trait AdapterCapability: Send + Sync {
    async fn call(&self, adapter: &str, input: Value) -> Result<Value, CapabilityError>;
    async fn list(&self) -> Result<Value, CapabilityError>;
}

#[async_trait]
pub trait EmbeddingCapability: Send + Sync {
    async fn embed(&self, texts: Vec<String>) -> Result<Value, CapabilityError>;
}

#[async_trait]
pub trait VectorCapability: Send + Sync {
    async fn upsert(&self, collection: &str, points: Value) -> Result<Value, CapabilityError>;
    async fn query(&self, collection: &str, query: Value) -> Result<Value, CapabilityError>;
    async fn delete(&self, collection: &str, ids: Value) -> Result<Value, CapabilityError>;
    async fn list_collections(&self) -> Result<Value, CapabilityError>;
}

/// Bundle of capabilities plus the read-only secret/env maps for one step
/// execution. Secrets are resolved per execution and never cached across
/// tenants.
#[derive(Clone)]
pub struct SandboxServices {
    pub http: Arc<dyn HttpCapability>,
    pub llm: Arc<dyn LlmCapability>,
    pub workflow: Arc<dyn WorkflowCapability>,
    pub human: Arc<dyn HumanCapability>,
    pub adapter: Arc<dyn AdapterCapability>,
    pub embedding: Arc<dyn EmbeddingCapability>,
    pub vector: Arc<dyn VectorCapability>,
    pub secrets: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

impl SandboxServices {
    /// Services where every capability fails with an `SYS_003 unavailable`
    /// error. Tests replace the pieces they exercise.
    pub fn noop() -> Self {
        let unavailable = Arc::new(Unavailable);
        Self {
            http: unavailable.clone(),
            llm: unavailable.clone(),
            workflow: unavailable.clone(),
            human: unavailable.clone(),
            adapter: unavailable.clone(),
            embedding: unavailable.clone(),
            vector: unavailable,
            secrets: HashMap::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpCapability>) -> Self {
        self.http = http;
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmCapability>) -> Self {
        self.llm = llm;
        self
    }

    pub fn with_workflow(mut self, workflow: Arc<dyn WorkflowCapability>) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn with_human(mut self, human: Arc<dyn HumanCapability>) -> Self {
        self.human = human;
        self
    }
}

struct Unavailable;

fn unavailable(what: &str) -> CapabilityError {
    CapabilityError::new("SYS_003", format!("{what} capability is not available"))
}

#[async_trait]
impl HttpCapability for Unavailable {
    async fn request(&self, _request: HttpRequest) -> Result<HttpResponse, CapabilityError> {
        Err(unavailable("http"))
    }
}

#[async_trait]
impl LlmCapability for Unavailable {
    async fn chat(&self, _: &str, _: &str, _: Value) -> Result<LlmResponse, CapabilityError> {
        Err(unavailable("llm"))
    }

    async fn complete(&self, _: &str, _: &str, _: Value) -> Result<LlmResponse, CapabilityError> {
        Err(unavailable("llm"))
    }
}

#[async_trait]
impl WorkflowCapability for Unavailable {
    async fn run(&self, _: Uuid, _: Option<Uuid>, _: Value) -> Result<Value, CapabilityError> {
        Err(unavailable("workflow"))
    }
}

#[async_trait]
impl HumanCapability for Unavailable {
    async fn request_approval(&self, _: Value) -> Result<Value, CapabilityError> {
        Err(unavailable("human"))
    }
}

#[async_trait]
impl AdapterCapability for Unavailable {
    async fn call(&self, _: &str, _: Value) -> Result<Value, CapabilityError> {
        Err(unavailable("adapter"))
    }

    async fn list(&self) -> Result<Value, CapabilityError> {
        Err(unavailable("adapter"))
    }
}

#[async_trait]
impl EmbeddingCapability for Unavailable {
    async fn embed(&self, _: Vec<String>) -> Result<Value, CapabilityError> {
        Err(unavailable("embedding"))
    }
}

#[async_trait]
impl VectorCapability for Unavailable {
    async fn upsert(&self, _: &str, _: Value) -> Result<Value, CapabilityError> {
        Err(unavailable("vector"))
    }

    async fn query(&self, _: &str, _: Value) -> Result<Value, CapabilityError> {
        Err(unavailable("vector"))
    }

    async fn delete(&self, _: &str, _: Value) -> Result<Value, CapabilityError> {
        Err(unavailable("vector"))
    }

    async fn list_collections(&self) -> Result<Value, CapabilityError> {
        Err(unavailable("vector"))
    }
}
