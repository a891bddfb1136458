//! Run-level error types.

use thiserror::Error;
use uuid::Uuid;

use super::StepError;

/// Errors raised while driving a run or operating engine services.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Project not found: {0}")]
    ProjectNotFound(Uuid),
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),
    #[error("Step not found: {0}")]
    StepNotFound(Uuid),
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(Uuid),
    #[error("No start step: {0}")]
    NoStartStep(String),
    #[error("Cycle detected in project graph")]
    CycleDetected,
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Circular inheritance involving block '{0}'")]
    CircularInheritance(String),
    #[error("Inheritance depth {depth} exceeds maximum {max} for block '{slug}'")]
    DepthExceeded { slug: String, depth: usize, max: usize },
    #[error("Block '{0}' cannot be inherited: no ancestor defines code")]
    NotInheritable(String),
    #[error("Unknown parent block for '{0}'")]
    UnknownParent(String),
    #[error("Invalid block definition '{slug}': {reason}")]
    InvalidBlock { slug: String, reason: String },
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("Run cancelled")]
    Cancelled,
    #[error("Step execution failed: step={step_id}, error={source}")]
    StepFailed {
        step_id: Uuid,
        #[source]
        source: StepError,
    },
    #[error("Group '{group}' failed: {message}")]
    GroupFailed { group: String, message: String },
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Queue error: {0}")]
    Queue(String),
    #[error("Internal error: {0}")]
    Internal(String),
}
