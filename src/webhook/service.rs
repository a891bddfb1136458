//! Run-control operations backing the engine-owned HTTP routes.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{ApiError, EngineError, ErrorCode};
use crate::model::{
    ExecutionMode, Job, Run, StepRun, StepRunStatus, StepType, TriggeredBy,
};
use crate::queue::JobQueue;
use crate::storage::{ProjectStore, RunStore};

pub struct RunService {
    project_store: Arc<dyn ProjectStore>,
    run_store: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
}

impl RunService {
    pub fn new(
        project_store: Arc<dyn ProjectStore>,
        run_store: Arc<dyn RunStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            project_store,
            run_store,
            queue,
        }
    }

    /// `POST /projects/{id}/runs`
    pub async fn create_run(
        &self,
        project_id: Uuid,
        start_step_id: Option<Uuid>,
        triggered_by: TriggeredBy,
        version: Option<i32>,
        input: Value,
    ) -> Result<Run, ApiError> {
        let project = self
            .project_store
            .get_project(project_id)
            .await?
            .ok_or_else(|| ApiError::not_found("project not found"))?;

        let definition = if triggered_by == TriggeredBy::Test {
            self.project_store.get_draft_definition(project_id).await?
        } else {
            self.project_store.get_definition(project_id, version).await?
        }
        .ok_or_else(|| ApiError::not_found("project has no published version"))?;

        let start_step_id = match start_step_id {
            Some(id) => {
                let step = definition
                    .step(id)
                    .ok_or_else(|| ApiError::not_found("start step not found"))?;
                if step.step_type != StepType::Start {
                    return Err(ApiError::new(
                        ErrorCode::ValidationError,
                        "start_step_id does not reference a start step",
                    ));
                }
                id
            }
            None => {
                let starts = definition.start_steps();
                match starts.as_slice() {
                    [only] => only.id,
                    [] => {
                        return Err(ApiError::new(
                            ErrorCode::ValidationError,
                            "project has no start step",
                        ))
                    }
                    _ => {
                        return Err(ApiError::new(
                            ErrorCode::ValidationError,
                            "project has multiple start steps; pass start_step_id",
                        ))
                    }
                }
            }
        };

        let run_number = self
            .run_store
            .next_run_number(project_id, triggered_by)
            .await?;
        let run = Run::new(
            project.tenant_id,
            project_id,
            version.unwrap_or(project.version),
            start_step_id,
            run_number,
            triggered_by,
            input.clone(),
        );
        self.run_store.create_run(run.clone()).await?;

        let job = Job::new(
            project.tenant_id,
            project_id,
            start_step_id,
            run.id,
            triggered_by,
            input,
        );
        self.queue.enqueue(job).await?;
        info!(run_id = %run.id, %project_id, run_number, "run created");
        Ok(run)
    }

    /// `GET /runs/{id}`
    pub async fn get_run(&self, run_id: Uuid) -> Result<(Run, Vec<StepRun>), ApiError> {
        let run = self
            .run_store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ApiError::not_found("run not found"))?;
        let mut step_runs = self.run_store.list_step_runs(run_id).await?;
        step_runs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then(a.attempt.cmp(&b.attempt))
        });
        Ok((run, step_runs))
    }

    /// `POST /runs/{id}/cancel`. Cancelling an already-terminal run returns
    /// `INVALID_STATE` and leaves state unchanged.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run, ApiError> {
        let mut run = self
            .run_store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ApiError::not_found("run not found"))?;
        if run.status.is_terminal() {
            return Err(ApiError::invalid_state(format!(
                "run is already {:?}",
                run.status
            )));
        }

        self.run_store.request_cancel(run_id).await?;
        // Pending runs are finalized immediately; a running orchestrator
        // observes the flag at its next dispatch boundary.
        if run.status == crate::model::RunStatus::Pending {
            run.cancel();
            self.run_store.update_run(run.clone()).await?;
        }
        info!(%run_id, "cancellation requested");
        Ok(run)
    }

    /// `POST /runs/{id}/resume` - fork a new run starting at `from_step_id`.
    /// The prior run is never mutated.
    pub async fn resume_run(
        &self,
        run_id: Uuid,
        from_step_id: Uuid,
        input_override: Option<Value>,
    ) -> Result<Run, ApiError> {
        let prior = self
            .run_store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ApiError::not_found("run not found"))?;

        let input = match input_override {
            Some(input) => input,
            None => self
                .latest_step_input(run_id, from_step_id)
                .await?
                .unwrap_or(prior.input.clone()),
        };

        let run_number = self
            .run_store
            .next_run_number(prior.project_id, prior.triggered_by)
            .await?;
        let run = Run::new(
            prior.tenant_id,
            prior.project_id,
            prior.project_version,
            from_step_id,
            run_number,
            prior.triggered_by,
            input.clone(),
        );
        self.run_store.create_run(run.clone()).await?;

        let job = Job::new(
            prior.tenant_id,
            prior.project_id,
            from_step_id,
            run.id,
            prior.triggered_by,
            input,
        );
        self.queue.enqueue(job).await?;
        info!(prior_run = %run_id, new_run = %run.id, %from_step_id, "run resumed as fork");
        Ok(run)
    }

    /// `POST /runs/{id}/steps/{step_id}/execute` - ephemeral single-step
    /// test run producing a fresh StepRun.
    pub async fn execute_single_step(
        &self,
        run_id: Uuid,
        step_id: Uuid,
        input_override: Option<Value>,
    ) -> Result<Run, ApiError> {
        let prior = self
            .run_store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ApiError::not_found("run not found"))?;

        let input = match input_override {
            Some(input) => input,
            None => self
                .latest_step_input(run_id, step_id)
                .await?
                .unwrap_or(prior.input.clone()),
        };

        let run_number = self
            .run_store
            .next_run_number(prior.project_id, TriggeredBy::Test)
            .await?;
        let run = Run::new(
            prior.tenant_id,
            prior.project_id,
            prior.project_version,
            step_id,
            run_number,
            TriggeredBy::Test,
            input.clone(),
        );
        self.run_store.create_run(run.clone()).await?;

        let job = Job::new(
            prior.tenant_id,
            prior.project_id,
            step_id,
            run.id,
            TriggeredBy::Test,
            input,
        )
        .with_mode(ExecutionMode::SingleStep { step_id });
        self.queue.enqueue(job).await?;
        Ok(run)
    }

    async fn latest_step_input(
        &self,
        run_id: Uuid,
        step_id: Uuid,
    ) -> Result<Option<Value>, EngineError> {
        let step_runs = self.run_store.list_step_runs(run_id).await?;
        Ok(step_runs
            .into_iter()
            .filter(|sr| sr.step_id == step_id && sr.status != StepRunStatus::Skipped)
            .max_by_key(|sr| sr.attempt)
            .map(|sr| sr.input))
    }
}
