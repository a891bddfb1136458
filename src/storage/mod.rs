//! Storage traits the engine depends on, plus in-memory implementations.
//!
//! The engine never talks to a database directly; it reads published
//! project definitions and reads/writes runs, step runs, schedules and
//! idempotency records through these traits. SQL-backed implementations are
//! injected by the hosting service; the in-memory versions here back tests
//! and single-process deployments.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{
    Project, ProjectDefinition, ProjectVersion, Run, Schedule, StepRun, TriggeredBy,
};

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, EngineError>;
    async fn put_project(&self, project: Project) -> Result<(), EngineError>;
    /// The definition a run executes against: the snapshot of the given
    /// version, or the latest published version when `version` is `None`.
    async fn get_definition(
        &self,
        project_id: Uuid,
        version: Option<i32>,
    ) -> Result<Option<ProjectDefinition>, EngineError>;
    /// The current draft definition, used by `triggered_by=test` runs.
    async fn get_draft_definition(
        &self,
        project_id: Uuid,
    ) -> Result<Option<ProjectDefinition>, EngineError>;
    async fn put_version(&self, version: ProjectVersion) -> Result<(), EngineError>;
    async fn put_draft_definition(
        &self,
        project_id: Uuid,
        definition: ProjectDefinition,
    ) -> Result<(), EngineError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: Run) -> Result<(), EngineError>;
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, EngineError>;
    async fn update_run(&self, run: Run) -> Result<(), EngineError>;
    /// Allocate the next monotonic run number for (project, triggered_by).
    async fn next_run_number(
        &self,
        project_id: Uuid,
        triggered_by: TriggeredBy,
    ) -> Result<i64, EngineError>;

    async fn insert_step_run(&self, step_run: StepRun) -> Result<(), EngineError>;
    async fn update_step_run(&self, step_run: StepRun) -> Result<(), EngineError>;
    async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, EngineError>;
    /// Next attempt number for (run, step): one past the highest recorded.
    async fn next_attempt(&self, run_id: Uuid, step_id: Uuid) -> Result<u32, EngineError>;

    /// Durable cancellation flag observed by the orchestrator between step
    /// dispatches.
    async fn request_cancel(&self, run_id: Uuid) -> Result<(), EngineError>;
    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, EngineError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn put_schedule(&self, schedule: Schedule) -> Result<(), EngineError>;
    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, EngineError>;
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Schedule>, EngineError>;
    /// Per-schedule advisory lock so replicas do not double-fire. Returns
    /// false when another holder owns the lock.
    async fn try_lock(&self, id: Uuid) -> Result<bool, EngineError>;
    async fn unlock(&self, id: Uuid) -> Result<(), EngineError>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Record `key -> run_id` unless a live record exists; returns the run
    /// id that owns the key either way.
    async fn put_if_absent(
        &self,
        key: &str,
        run_id: Uuid,
        ttl: chrono::Duration,
    ) -> Result<Uuid, EngineError>;
    async fn get(&self, key: &str) -> Result<Option<Uuid>, EngineError>;
}

/// One metered capability call (LLM tokens, HTTP egress) attributed to a
/// step run.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub tenant_id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub kind: String,
    pub quantity: i64,
    pub detail: Value,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<(), EngineError>;
}
