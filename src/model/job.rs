//! Queue job entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Claimed,
    Done,
}

/// What the worker should do with the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Walk the DAG from the run's start step.
    Full,
    /// Execute exactly one step, no successors.
    SingleStep { step_id: Uuid },
    /// Resume a suspended run at the given step run.
    Resume { step_run_id: Uuid },
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Full
    }
}

/// Durable queue item. Consumed exactly once via atomic claim; the run id
/// makes redelivery idempotent (terminal runs complete the job silently).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub start_step_id: Uuid,
    pub run_id: Uuid,
    pub triggered_by: super::TriggeredBy,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub input: Value,
    pub status: JobStatus,
    /// Earliest time the job may be claimed. Delayed re-enqueues (long waits)
    /// set this in the future.
    pub available_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        tenant_id: Uuid,
        project_id: Uuid,
        start_step_id: Uuid,
        run_id: Uuid,
        triggered_by: super::TriggeredBy,
        input: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            project_id,
            start_step_id,
            run_id,
            triggered_by,
            priority: JobPriority::Normal,
            mode: ExecutionMode::Full,
            input,
            status: JobStatus::Queued,
            available_at: now,
            claimed_by: None,
            lease_expires_at: None,
            created_at: now,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn delayed_until(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = at;
        self
    }
}
