//! DashMap-backed storage for tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    IdempotencyStore, ProjectStore, RunStore, ScheduleStore, UsageRecord, UsageSink,
};
use crate::error::EngineError;
use crate::model::{
    Project, ProjectDefinition, ProjectVersion, Run, Schedule, StepRun, TriggeredBy,
};

#[derive(Default)]
pub struct MemoryStore {
    projects: DashMap<Uuid, Project>,
    versions: DashMap<(Uuid, i32), ProjectVersion>,
    drafts: DashMap<Uuid, ProjectDefinition>,
    runs: DashMap<Uuid, Run>,
    run_numbers: Mutex<HashMap<(Uuid, TriggeredBy), i64>>,
    step_runs: DashMap<Uuid, Vec<StepRun>>,
    cancel_flags: DashMap<Uuid, ()>,
    schedules: DashMap<Uuid, Schedule>,
    schedule_locks: DashMap<Uuid, ()>,
    idempotency: DashMap<String, (Uuid, DateTime<Utc>)>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.lock().clone()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, EngineError> {
        Ok(self.projects.get(&id).map(|p| p.clone()))
    }

    async fn put_project(&self, project: Project) -> Result<(), EngineError> {
        self.projects.insert(project.id, project);
        Ok(())
    }

    async fn get_definition(
        &self,
        project_id: Uuid,
        version: Option<i32>,
    ) -> Result<Option<ProjectDefinition>, EngineError> {
        let version = match version {
            Some(v) => v,
            None => match self.projects.get(&project_id) {
                Some(project) => project.version,
                None => return Ok(None),
            },
        };
        Ok(self
            .versions
            .get(&(project_id, version))
            .map(|v| v.definition.clone()))
    }

    async fn get_draft_definition(
        &self,
        project_id: Uuid,
    ) -> Result<Option<ProjectDefinition>, EngineError> {
        Ok(self.drafts.get(&project_id).map(|d| d.clone()))
    }

    async fn put_version(&self, version: ProjectVersion) -> Result<(), EngineError> {
        self.versions
            .insert((version.project_id, version.version), version);
        Ok(())
    }

    async fn put_draft_definition(
        &self,
        project_id: Uuid,
        definition: ProjectDefinition,
    ) -> Result<(), EngineError> {
        self.drafts.insert(project_id, definition);
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: Run) -> Result<(), EngineError> {
        self.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, EngineError> {
        Ok(self.runs.get(&id).map(|r| r.clone()))
    }

    async fn update_run(&self, run: Run) -> Result<(), EngineError> {
        self.runs.insert(run.id, run);
        Ok(())
    }

    async fn next_run_number(
        &self,
        project_id: Uuid,
        triggered_by: TriggeredBy,
    ) -> Result<i64, EngineError> {
        let mut numbers = self.run_numbers.lock();
        let counter = numbers.entry((project_id, triggered_by)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn insert_step_run(&self, step_run: StepRun) -> Result<(), EngineError> {
        self.step_runs
            .entry(step_run.run_id)
            .or_default()
            .push(step_run);
        Ok(())
    }

    async fn update_step_run(&self, step_run: StepRun) -> Result<(), EngineError> {
        let mut entry = self.step_runs.entry(step_run.run_id).or_default();
        match entry.iter_mut().find(|sr| sr.id == step_run.id) {
            Some(existing) => *existing = step_run,
            None => entry.push(step_run),
        }
        Ok(())
    }

    async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, EngineError> {
        Ok(self
            .step_runs
            .get(&run_id)
            .map(|runs| runs.clone())
            .unwrap_or_default())
    }

    async fn next_attempt(&self, run_id: Uuid, step_id: Uuid) -> Result<u32, EngineError> {
        let highest = self
            .step_runs
            .get(&run_id)
            .map(|runs| {
                runs.iter()
                    .filter(|sr| sr.step_id == step_id)
                    .map(|sr| sr.attempt)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        Ok(highest + 1)
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.cancel_flags.insert(run_id, ());
        Ok(())
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool, EngineError> {
        Ok(self.cancel_flags.contains_key(&run_id))
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn put_schedule(&self, schedule: Schedule) -> Result<(), EngineError> {
        self.schedules.insert(schedule.id, schedule);
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, EngineError> {
        Ok(self.schedules.get(&id).map(|s| s.clone()))
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Schedule>, EngineError> {
        let mut due: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|entry| entry.is_due(now))
            .map(|entry| entry.clone())
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn try_lock(&self, id: Uuid) -> Result<bool, EngineError> {
        Ok(self.schedule_locks.insert(id, ()).is_none())
    }

    async fn unlock(&self, id: Uuid) -> Result<(), EngineError> {
        self.schedule_locks.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn put_if_absent(
        &self,
        key: &str,
        run_id: Uuid,
        ttl: Duration,
    ) -> Result<Uuid, EngineError> {
        let now = Utc::now();
        // Expired records are replaced in place.
        if let Some(existing) = self.idempotency.get(key) {
            let (owner, expires_at) = *existing;
            if expires_at > now {
                return Ok(owner);
            }
        }
        self.idempotency
            .insert(key.to_string(), (run_id, now + ttl));
        Ok(run_id)
    }

    async fn get(&self, key: &str) -> Result<Option<Uuid>, EngineError> {
        Ok(self.idempotency.get(key).and_then(|entry| {
            let (owner, expires_at) = *entry;
            (expires_at > Utc::now()).then_some(owner)
        }))
    }
}

#[async_trait]
impl UsageSink for MemoryStore {
    async fn record(&self, record: UsageRecord) -> Result<(), EngineError> {
        self.usage.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_number_monotonic_per_trigger() {
        let store = MemoryStore::new();
        let project = Uuid::new_v4();

        assert_eq!(store.next_run_number(project, TriggeredBy::Manual).await.unwrap(), 1);
        assert_eq!(store.next_run_number(project, TriggeredBy::Manual).await.unwrap(), 2);
        // Independent counter per trigger source.
        assert_eq!(store.next_run_number(project, TriggeredBy::Webhook).await.unwrap(), 1);
        // And per project.
        let other = Uuid::new_v4();
        assert_eq!(store.next_run_number(other, TriggeredBy::Manual).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_next_attempt_counts_from_history() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();

        assert_eq!(store.next_attempt(run_id, step_id).await.unwrap(), 1);
        store
            .insert_step_run(StepRun::new(run_id, step_id, "s", 1))
            .await
            .unwrap();
        store
            .insert_step_run(StepRun::new(run_id, step_id, "s", 2))
            .await
            .unwrap();
        assert_eq!(store.next_attempt(run_id, step_id).await.unwrap(), 3);
        // Another step in the same run starts at 1.
        assert_eq!(store.next_attempt(run_id, Uuid::new_v4()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_definition_resolves_latest_published() {
        let store = MemoryStore::new();
        let mut project = Project::new(Uuid::new_v4(), "demo");
        let project_id = project.id;

        let v2 = project.publish(ProjectDefinition::default());
        store.put_project(project.clone()).await.unwrap();
        store.put_version(v2).await.unwrap();

        assert!(store.get_definition(project_id, None).await.unwrap().is_some());
        assert!(store.get_definition(project_id, Some(2)).await.unwrap().is_some());
        assert!(store.get_definition(project_id, Some(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idempotency_ttl() {
        let store = MemoryStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let owner = store
            .put_if_absent("key-1", first, Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(owner, first);

        // Duplicate within the window resolves to the original run.
        let owner = store
            .put_if_absent("key-1", second, Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(owner, first);

        // Expired record is replaced.
        let owner = store
            .put_if_absent("key-2", first, Duration::seconds(-1))
            .await
            .unwrap();
        assert_eq!(owner, first);
        let owner = store
            .put_if_absent("key-2", second, Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(owner, second);
    }

    #[tokio::test]
    async fn test_schedule_lock_is_exclusive() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        assert!(store.try_lock(id).await.unwrap());
        assert!(!store.try_lock(id).await.unwrap());
        store.unlock(id).await.unwrap();
        assert!(store.try_lock(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_flag() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        assert!(!store.cancel_requested(run_id).await.unwrap());
        store.request_cancel(run_id).await.unwrap();
        assert!(store.cancel_requested(run_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_usage_records_accumulate() {
        let store = MemoryStore::new();
        store
            .record(UsageRecord {
                tenant_id: Uuid::new_v4(),
                run_id: Uuid::new_v4(),
                step_id: Uuid::new_v4(),
                kind: "llm_tokens".into(),
                quantity: 128,
                detail: json!({"model": "gpt-4o"}),
                at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(store.usage_records().len(), 1);
    }
}
