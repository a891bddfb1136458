//! Project definition entities: steps, edges and block groups.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a project. Step/edge/group edits are only permitted
/// while the project is a draft; publishing snapshots an immutable version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Published,
}

/// Tenant-scoped DAG container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub status: ProjectStatus,
    pub version: i32,
    /// Shared variables exposed to step config templates as `ctx.variables.*`.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(tenant_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            status: ProjectStatus::Draft,
            version: 1,
            variables: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_editable(&self) -> bool {
        self.status == ProjectStatus::Draft
    }

    /// Publish the project, bumping its version. Returns the snapshot to
    /// persist as an immutable [`ProjectVersion`].
    pub fn publish(&mut self, definition: ProjectDefinition) -> ProjectVersion {
        self.status = ProjectStatus::Published;
        self.version += 1;
        self.updated_at = Utc::now();
        ProjectVersion {
            id: Uuid::new_v4(),
            project_id: self.id,
            version: self.version,
            definition,
            created_at: self.updated_at,
        }
    }
}

/// Immutable snapshot of a project definition at a published version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectVersion {
    pub id: Uuid,
    pub project_id: Uuid,
    pub version: i32,
    pub definition: ProjectDefinition,
    pub created_at: DateTime<Utc>,
}

/// The resolved graph a run executes against: steps, edges and groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectDefinition {
    pub steps: Vec<Step>,
    pub edges: Vec<Edge>,
    pub groups: Vec<BlockGroup>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl ProjectDefinition {
    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn group(&self, id: Uuid) -> Option<&BlockGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn group_members(&self, group_id: Uuid) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.block_group_id == Some(group_id))
            .collect()
    }

    pub fn start_steps(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.step_type == StepType::Start)
            .collect()
    }
}

/// Fixed step types. Other block slugs are reachable through
/// [`StepType::Custom`], which carries the slug verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Start,
    Llm,
    Tool,
    Condition,
    Switch,
    Map,
    Subflow,
    Wait,
    HumanInLoop,
    Code,
    Router,
    Log,
    #[serde(untagged)]
    Custom(String),
}

impl StepType {
    /// System block slug executing this step type.
    pub fn slug(&self) -> &str {
        match self {
            StepType::Start => "start",
            StepType::Llm => "llm",
            StepType::Tool => "tool",
            StepType::Condition => "condition",
            StepType::Switch => "switch",
            StepType::Map => "map",
            StepType::Subflow => "subflow",
            StepType::Wait => "wait",
            StepType::HumanInLoop => "human_in_loop",
            StepType::Code => "code",
            StepType::Router => "router",
            StepType::Log => "log",
            StepType::Custom(slug) => slug,
        }
    }

    /// Step types whose outgoing edges are selected by port label.
    pub fn is_branching(&self) -> bool {
        matches!(
            self,
            StepType::Condition | StepType::Switch | StepType::Router
        )
    }
}

/// How runs originate from a start step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Schedule,
    Webhook,
}

/// Node in the project DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub config: Value,
    /// Set iff `step_type == Start`.
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub trigger_config: Option<Value>,
    pub block_group_id: Option<Uuid>,
    pub block_definition_id: Option<Uuid>,
    #[serde(default)]
    pub position: (f64, f64),
}

impl Step {
    pub fn new(project_id: Uuid, name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            step_type,
            config: Value::Object(Default::default()),
            trigger_type: None,
            trigger_config: None,
            block_group_id: None,
            block_definition_id: None,
            position: (0.0, 0.0),
        }
    }

    pub fn start(project_id: Uuid, name: impl Into<String>, trigger: TriggerType) -> Self {
        let mut step = Self::new(project_id, name, StepType::Start);
        step.trigger_type = Some(trigger);
        step
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn in_group(mut self, group_id: Uuid) -> Self {
        self.block_group_id = Some(group_id);
        self
    }

    /// A start step carries a trigger type and may not live inside a group.
    pub fn validate(&self) -> Result<(), String> {
        match self.step_type {
            StepType::Start => {
                if self.trigger_type.is_none() {
                    return Err("start step requires a trigger_type".into());
                }
                if self.block_group_id.is_some() {
                    return Err("start step may not be a member of a block group".into());
                }
            }
            _ => {
                if self.trigger_type.is_some() {
                    return Err("trigger_type is only valid on start steps".into());
                }
            }
        }
        Ok(())
    }
}

/// Directed connection. Either endpoint may be a step or a block group
/// (groups expose `out`/`error` ports).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_step_id: Option<Uuid>,
    pub source_group_id: Option<Uuid>,
    pub target_step_id: Option<Uuid>,
    pub target_group_id: Option<Uuid>,
    /// Port label (`then`/`else`, `case_k`, `out`/`error`). `None` means the
    /// edge is always active.
    pub source_port: Option<String>,
    /// Optional expression evaluated against the source output.
    pub condition: Option<String>,
}

impl Edge {
    pub fn new(project_id: Uuid, source_step: Uuid, target_step: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            source_step_id: Some(source_step),
            source_group_id: None,
            target_step_id: Some(target_step),
            target_group_id: None,
            source_port: None,
            condition: None,
        }
    }

    pub fn from_group(project_id: Uuid, source_group: Uuid, target_step: Uuid) -> Self {
        Self {
            source_step_id: None,
            source_group_id: Some(source_group),
            ..Self::new(project_id, target_step, target_step)
        }
    }

    pub fn to_group(project_id: Uuid, source_step: Uuid, target_group: Uuid) -> Self {
        Self {
            target_step_id: None,
            target_group_id: Some(target_group),
            ..Self::new(project_id, source_step, source_step)
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = Some(port.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Exactly one source and one target endpoint must be set.
    pub fn validate(&self) -> Result<(), String> {
        if self.source_step_id.is_some() == self.source_group_id.is_some() {
            return Err("edge requires exactly one source endpoint".into());
        }
        if self.target_step_id.is_some() == self.target_group_id.is_some() {
            return Err("edge requires exactly one target endpoint".into());
        }
        Ok(())
    }
}

/// Control-flow container types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    Parallel,
    TryCatch,
    Foreach,
    While,
}

/// Structural container implementing a control-flow construct over its body
/// steps (the steps whose `block_group_id` points at it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockGroup {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    #[serde(default)]
    pub config: Value,
    pub parent_group_id: Option<Uuid>,
    pub pre_process: Option<String>,
    pub post_process: Option<String>,
}

impl BlockGroup {
    pub fn new(project_id: Uuid, name: impl Into<String>, group_type: GroupType) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            group_type,
            config: Value::Object(Default::default()),
            parent_group_id: None,
            pre_process: None,
            post_process: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// `parallel` group config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// 0 means unbounded.
    #[serde(default)]
    pub max_concurrent: usize,
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            fail_fast: false,
        }
    }
}

/// `try_catch` group config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TryCatchConfig {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
}

/// `foreach` group config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeachConfig {
    #[serde(default = "default_input_path")]
    pub input_path: String,
    #[serde(default)]
    pub parallel: bool,
    /// 0 means one worker per element.
    #[serde(default)]
    pub max_workers: usize,
}

fn default_input_path() -> String {
    "$.items".to_string()
}

impl Default for ForeachConfig {
    fn default() -> Self {
        Self {
            input_path: default_input_path(),
            parallel: false,
            max_workers: 0,
        }
    }
}

/// `while` group config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhileConfig {
    #[serde(default)]
    pub condition: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    #[serde(default)]
    pub do_while: bool,
}

fn default_max_iterations() -> u64 {
    100
}

impl Default for WhileConfig {
    fn default() -> Self {
        Self {
            condition: String::new(),
            max_iterations: default_max_iterations(),
            do_while: false,
        }
    }
}
