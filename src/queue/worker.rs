//! Worker pool: claim jobs, drive runs, heartbeat leases.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::JobQueue;
use crate::blocks::BlockRegistry;
use crate::engine::{
    ApprovalHub, GroupExecutor, RunContext, RunOrchestrator, RunOutcome, StepExecutor,
};
use crate::error::EngineError;
use crate::model::{ExecutionMode, Job, ProjectDefinition, TriggeredBy};
use crate::sandbox::{Sandbox, SandboxServices};
use crate::storage::{ProjectStore, RunStore, UsageSink};

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    project_store: Arc<dyn ProjectStore>,
    run_store: Arc<dyn RunStore>,
    usage: Arc<dyn UsageSink>,
    registry: Arc<BlockRegistry>,
    sandbox: Arc<Sandbox>,
    base_services: SandboxServices,
    approvals: Arc<ApprovalHub>,
    concurrency: usize,
    lease: Duration,
    poll_interval: StdDuration,
    step_timeout: StdDuration,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        project_store: Arc<dyn ProjectStore>,
        run_store: Arc<dyn RunStore>,
        usage: Arc<dyn UsageSink>,
        registry: Arc<BlockRegistry>,
        sandbox: Arc<Sandbox>,
        base_services: SandboxServices,
        approvals: Arc<ApprovalHub>,
    ) -> Self {
        Self {
            queue,
            project_store,
            run_store,
            usage,
            registry,
            sandbox,
            base_services,
            approvals,
            concurrency: 4,
            lease: Duration::minutes(5),
            poll_interval: StdDuration::from_millis(250),
            step_timeout: StdDuration::from_secs(30),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: StdDuration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_step_timeout(mut self, timeout: StdDuration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Spawn the worker loops; they drain until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|index| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("worker-{index}-{}", Uuid::new_v4());
                tokio::spawn(async move {
                    info!(worker_id, "worker started");
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            processed = pool.poll_once(&worker_id) => {
                                match processed {
                                    Ok(true) => {}
                                    Ok(false) => tokio::time::sleep(pool.poll_interval).await,
                                    Err(err) => {
                                        error!(worker_id, error = %err, "worker iteration failed");
                                        tokio::time::sleep(pool.poll_interval).await;
                                    }
                                }
                            }
                        }
                    }
                    info!(worker_id, "worker stopped");
                })
            })
            .collect()
    }

    /// Claim and process at most one job. Returns whether a job was handled.
    pub async fn poll_once(&self, worker_id: &str) -> Result<bool, EngineError> {
        let Some(job) = self.queue.claim(worker_id, self.lease).await? else {
            return Ok(false);
        };

        // Keep the lease alive while the run executes.
        let heartbeat = {
            let queue = self.queue.clone();
            let job_id = job.id;
            let worker = worker_id.to_string();
            let lease = self.lease;
            let every = StdDuration::from_millis((lease.num_milliseconds().max(2) / 2) as u64);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    if queue.extend_lease(job_id, &worker, lease).await.is_err() {
                        break;
                    }
                }
            })
        };

        let result = self.process_job(&job).await;
        heartbeat.abort();

        match result {
            Ok(()) => {
                self.queue.ack(job.id, worker_id).await?;
                Ok(true)
            }
            Err(err) => {
                // Failed runs are recorded on the run itself; the job is
                // done either way. Redelivery is only for worker crashes.
                warn!(job_id = %job.id, error = %err, "job processing ended with error");
                self.queue.ack(job.id, worker_id).await?;
                Ok(true)
            }
        }
    }

    async fn process_job(&self, job: &Job) -> Result<(), EngineError> {
        let Some(run) = self.run_store.get_run(job.run_id).await? else {
            warn!(job_id = %job.id, run_id = %job.run_id, "job references unknown run");
            return Ok(());
        };
        // Redelivered job for a finished run: complete silently.
        if run.status.is_terminal() {
            return Ok(());
        }

        let definition = self.load_definition(job, run.project_version).await?;
        let ctx = RunContext::new(
            run.id,
            run.tenant_id,
            run.project_id,
            run.triggered_by,
            Arc::new(definition),
        );

        let orchestrator = self.build_orchestrator(run.id);

        let outcome = match &job.mode {
            ExecutionMode::SingleStep { step_id } => {
                let input = job.input.clone();
                return orchestrator
                    .execute_single_step(&ctx, *step_id, input, run)
                    .await
                    .map(|_| ());
            }
            ExecutionMode::Full | ExecutionMode::Resume { .. } => {
                orchestrator.execute_run(&ctx, run).await
            }
        };

        match outcome {
            Ok(RunOutcome::Completed(_)) => Ok(()),
            Ok(RunOutcome::Suspended { delay }) => {
                // Re-enqueue a fresh job that becomes available once the
                // wait has elapsed.
                let mut requeued = job.clone();
                requeued.id = Uuid::new_v4();
                requeued.status = crate::model::JobStatus::Queued;
                requeued.claimed_by = None;
                requeued.lease_expires_at = None;
                requeued.available_at = chrono::Utc::now()
                    + Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(0));
                self.queue.enqueue(requeued).await?;
                Ok(())
            }
            Err(EngineError::Cancelled) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn load_definition(
        &self,
        job: &Job,
        version: i32,
    ) -> Result<ProjectDefinition, EngineError> {
        // Test runs execute the draft; everything else a published snapshot.
        let definition = if job.triggered_by == TriggeredBy::Test {
            self.project_store
                .get_draft_definition(job.project_id)
                .await?
        } else {
            // Version 0 pins nothing: use the latest published snapshot.
            self.project_store
                .get_definition(job.project_id, Some(version).filter(|v| *v > 0))
                .await?
        };
        definition.ok_or(EngineError::ProjectNotFound(job.project_id))
    }

    /// The per-run execution stack: approval capability bound to the run,
    /// metered capabilities layered per step by the step executor.
    pub fn build_orchestrator(&self, run_id: Uuid) -> RunOrchestrator {
        let services = self
            .base_services
            .clone()
            .with_human(self.approvals.capability(run_id));
        let step_executor = Arc::new(
            StepExecutor::new(
                self.registry.clone(),
                self.run_store.clone(),
                self.usage.clone(),
                self.sandbox.clone(),
                services.clone(),
            )
            .with_step_timeout(self.step_timeout),
        );
        let group_executor = Arc::new(GroupExecutor::new(self.sandbox.clone(), services));
        RunOrchestrator::new(step_executor, group_executor, self.run_store.clone())
    }
}

/// Helper used by trigger sources: create a pending run plus its queue job.
pub async fn enqueue_run(
    run_store: &Arc<dyn RunStore>,
    queue: &Arc<dyn JobQueue>,
    tenant_id: Uuid,
    project_id: Uuid,
    project_version: i32,
    start_step_id: Uuid,
    triggered_by: TriggeredBy,
    input: Value,
) -> Result<crate::model::Run, EngineError> {
    let run_number = run_store.next_run_number(project_id, triggered_by).await?;
    let run = crate::model::Run::new(
        tenant_id,
        project_id,
        project_version,
        start_step_id,
        run_number,
        triggered_by,
        input.clone(),
    );
    run_store.create_run(run.clone()).await?;

    let job = Job::new(tenant_id, project_id, start_step_id, run.id, triggered_by, input);
    queue.enqueue(job).await?;
    Ok(run)
}
