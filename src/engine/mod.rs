//! Run execution: step executor, group executor and the run orchestrator.

mod approval;
mod graph;
mod group_executor;
mod metered;
mod orchestrator;
mod step_executor;

pub use approval::ApprovalHub;
pub use graph::{validate_definition, NodeEdge, NodeGraph, NodeId, Scope};
pub use group_executor::GroupExecutor;
pub use orchestrator::{RunOrchestrator, RunOutcome};
pub use step_executor::{StepExecutor, StepOutcome};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::{ProjectDefinition, TriggeredBy};

/// Per-run execution context threaded through the orchestrator, group
/// executor and step executor.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub triggered_by: TriggeredBy,
    pub definition: Arc<ProjectDefinition>,
    /// Project variables exposed to config templates as `ctx.variables.*`.
    pub variables: HashMap<String, Value>,
    /// Cooperative cancellation: checked before each dispatch and inside
    /// group iteration loops; in-flight sandbox calls observe it too.
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        tenant_id: Uuid,
        project_id: Uuid,
        triggered_by: TriggeredBy,
        definition: Arc<ProjectDefinition>,
    ) -> Self {
        let variables = definition.variables.clone();
        Self {
            run_id,
            tenant_id,
            project_id,
            triggered_by,
            definition,
            variables,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
