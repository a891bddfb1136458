//! Run and step-run entities with lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How a run was triggered. Run numbers are monotonic per
/// (project, triggered_by) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Test,
    Webhook,
    Schedule,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    WaitingApproval,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One execution of a project from a chosen start step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub project_version: i32,
    pub start_step_id: Uuid,
    pub run_number: i64,
    pub triggered_by: TriggeredBy,
    pub status: RunStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        tenant_id: Uuid,
        project_id: Uuid,
        project_version: i32,
        start_step_id: Uuid,
        run_number: i64,
        triggered_by: TriggeredBy,
        input: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            project_id,
            project_version,
            start_step_id,
            run_number,
            triggered_by,
            status: RunStatus::Pending,
            input,
            output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, output: Value) {
        self.status = RunStatus::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn suspend_for_approval(&mut self) {
        self.status = RunStatus::WaitingApproval;
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// One log line captured from a step's sandbox execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub at: DateTime<Utc>,
}

/// One attempt at one step within a run. Attempts for a fixed (run, step)
/// are numbered contiguously from 1 and history is never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub status: StepRunStatus,
    pub attempt: u32,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    #[serde(default)]
    pub logs: Vec<StepLogEntry>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRun {
    pub fn new(run_id: Uuid, step_id: Uuid, step_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step_id,
            step_name: step_name.into(),
            status: StepRunStatus::Pending,
            attempt,
            input: Value::Null,
            output: None,
            error: None,
            error_code: None,
            logs: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self, input: Value) {
        self.status = StepRunStatus::Running;
        self.input = input;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, output: Value) {
        self.status = StepRunStatus::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, code: impl Into<String>, error: impl Into<String>) {
        self.status = StepRunStatus::Failed;
        self.error_code = Some(code.into());
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self) {
        self.status = StepRunStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = StepRunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            Uuid::new_v4(),
            1,
            TriggeredBy::Manual,
            json!({"x": 1}),
        );
        assert_eq!(run.status, RunStatus::Pending);
        assert!(!run.status.is_terminal());

        run.start();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());

        run.complete(json!({"done": true}));
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.status.is_terminal());
        assert!(run.duration_ms().is_some());
    }

    #[test]
    fn test_run_failure_records_error() {
        let mut run = Run::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            Uuid::new_v4(),
            1,
            TriggeredBy::Webhook,
            Value::Null,
        );
        run.start();
        run.fail("boom");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_waiting_approval_is_not_terminal() {
        let mut run = Run::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            Uuid::new_v4(),
            1,
            TriggeredBy::Manual,
            Value::Null,
        );
        run.start();
        run.suspend_for_approval();
        assert_eq!(run.status, RunStatus::WaitingApproval);
        assert!(!run.status.is_terminal());
    }

    #[test]
    fn test_step_run_attempts() {
        let run_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();

        let mut first = StepRun::new(run_id, step_id, "fetch", 1);
        first.start(json!({"url": "https://example.com"}));
        first.fail("HTTP_STATUS", "HTTP status 500");
        assert_eq!(first.attempt, 1);
        assert_eq!(first.status, StepRunStatus::Failed);
        assert_eq!(first.error_code.as_deref(), Some("HTTP_STATUS"));

        let mut second = StepRun::new(run_id, step_id, "fetch", 2);
        second.start(json!({"url": "https://example.com"}));
        second.complete(json!({"status": 200}));
        assert_eq!(second.attempt, 2);
        assert_eq!(second.status, StepRunStatus::Completed);
    }
}
