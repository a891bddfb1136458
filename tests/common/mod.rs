//! Shared harness for end-to-end engine tests: in-memory stores, the real
//! sandbox and block registry, and a single-worker pump.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use conflux::engine::ApprovalHub;
use conflux::model::{
    Project, ProjectDefinition, Run, RunStatus, StepRun, TriggeredBy,
};
use conflux::queue::{enqueue_run, MemoryJobQueue, WorkerPool};
use conflux::sandbox::{Sandbox, SandboxServices};
use conflux::storage::{MemoryStore, ProjectStore, RunStore};
use conflux::BlockRegistry;
use uuid::Uuid;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub registry: Arc<BlockRegistry>,
    pub approvals: Arc<ApprovalHub>,
    pub pool: Arc<WorkerPool>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_services(SandboxServices::noop())
    }

    pub fn with_services(services: SandboxServices) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let registry = Arc::new(BlockRegistry::with_system_blocks(50).unwrap());
        let approvals = Arc::new(ApprovalHub::new(store.clone()));
        let pool = Arc::new(
            WorkerPool::new(
                queue.clone(),
                store.clone(),
                store.clone(),
                store.clone(),
                registry.clone(),
                Arc::new(Sandbox::default()),
                services,
                approvals.clone(),
            )
            .with_poll_interval(Duration::from_millis(10)),
        );
        Self {
            store,
            queue,
            registry,
            approvals,
            pool,
        }
    }

    /// Create and publish a project around the given definition.
    pub async fn publish(&self, definition: ProjectDefinition) -> Project {
        let mut project = Project::new(Uuid::new_v4(), "test-project");
        let version = project.publish(definition);
        self.store.put_project(project.clone()).await.unwrap();
        self.store.put_version(version).await.unwrap();
        project
    }

    /// Enqueue a run and pump the worker until the run reaches a terminal
    /// state (following suspensions through the queue).
    pub async fn run_to_completion(
        &self,
        project: &Project,
        start_step_id: Uuid,
        input: serde_json::Value,
    ) -> Run {
        let run = enqueue_run(
            &(self.store.clone() as Arc<dyn RunStore>),
            &(self.queue.clone() as Arc<dyn conflux::queue::JobQueue>),
            project.tenant_id,
            project.id,
            project.version,
            start_step_id,
            TriggeredBy::Manual,
            input,
        )
        .await
        .unwrap();
        self.pump_until_terminal(run.id).await
    }

    pub async fn pump_until_terminal(&self, run_id: Uuid) -> Run {
        for _ in 0..600 {
            let _ = self.pool.poll_once("test-worker").await.unwrap();
            let run = self.store.get_run(run_id).await.unwrap().unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} did not reach a terminal state");
    }

    pub async fn step_runs_for(&self, run_id: Uuid, step_id: Uuid) -> Vec<StepRun> {
        let mut step_runs: Vec<StepRun> = self
            .store
            .list_step_runs(run_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|sr| sr.step_id == step_id)
            .collect();
        step_runs.sort_by_key(|sr| sr.attempt);
        step_runs
    }
}

pub fn assert_completed(run: &Run) {
    assert_eq!(
        run.status,
        RunStatus::Completed,
        "run should complete, got {:?} (error: {:?})",
        run.status,
        run.error
    );
}
