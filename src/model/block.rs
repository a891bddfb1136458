//! Reusable block definitions with inheritance metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCategory {
    Ai,
    Logic,
    Integration,
    Data,
    Control,
    Utility,
}

/// Error code declared by a block, used to classify thrown `[CODE]` errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCodeDef {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub retryable: bool,
}

/// A sub-step executed sequentially inside a composite block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalStep {
    /// Block slug to execute.
    #[serde(rename = "type")]
    pub block_slug: String,
    #[serde(default)]
    pub config: Value,
    /// Key under which this step's output is merged into the running input.
    pub output_key: String,
}

/// Reusable execution template. Blocks may inherit from a parent; the
/// resolver (blocks::resolver) derives `resolved_code`,
/// `resolved_config_defaults` and the pre/post chains, which are never
/// user-edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub id: Uuid,
    /// `None` marks a system block.
    pub tenant_id: Option<Uuid>,
    pub slug: String,
    pub name: String,
    pub category: BlockCategory,
    /// JavaScript executed in the sandbox. May be empty only when inherited.
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub pre_process: String,
    #[serde(default)]
    pub post_process: String,
    #[serde(default = "empty_object")]
    pub config_schema: Value,
    #[serde(default = "empty_object")]
    pub input_schema: Value,
    #[serde(default = "empty_object")]
    pub output_schema: Value,
    #[serde(default = "empty_object")]
    pub ui_config: Value,
    pub is_system: bool,
    pub version: i32,
    pub parent_block_id: Option<Uuid>,
    #[serde(default = "empty_object")]
    pub config_defaults: Value,
    #[serde(default)]
    pub internal_steps: Vec<InternalStep>,
    #[serde(default)]
    pub error_codes: Vec<ErrorCodeDef>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl BlockDefinition {
    pub fn new(slug: impl Into<String>, name: impl Into<String>, category: BlockCategory) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: None,
            slug: slug.into(),
            name: name.into(),
            category,
            code: String::new(),
            pre_process: String::new(),
            post_process: String::new(),
            config_schema: empty_object(),
            input_schema: empty_object(),
            output_schema: empty_object(),
            ui_config: empty_object(),
            is_system: false,
            version: 1,
            parent_block_id: None,
            config_defaults: empty_object(),
            internal_steps: Vec::new(),
            error_codes: Vec::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn system(slug: impl Into<String>, name: impl Into<String>, category: BlockCategory) -> Self {
        let mut block = Self::new(slug, name, category);
        block.is_system = true;
        block
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_pre_process(mut self, code: impl Into<String>) -> Self {
        self.pre_process = code.into();
        self
    }

    pub fn with_post_process(mut self, code: impl Into<String>) -> Self {
        self.post_process = code.into();
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_block_id = Some(parent);
        self
    }

    pub fn with_config_schema(mut self, schema: Value) -> Self {
        self.config_schema = schema;
        self
    }

    pub fn with_config_defaults(mut self, defaults: Value) -> Self {
        self.config_defaults = defaults;
        self
    }

    pub fn with_error_codes(mut self, codes: Vec<ErrorCodeDef>) -> Self {
        self.error_codes = codes;
        self
    }

    pub fn is_system_block(&self) -> bool {
        self.tenant_id.is_none()
    }

    /// Only blocks whose chain reaches code can execute; a root must define
    /// code itself.
    pub fn has_own_code(&self) -> bool {
        !self.code.trim().is_empty()
    }
}
