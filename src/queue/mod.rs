//! Durable job queue with atomic claiming and leases.

mod worker;

pub use worker::{enqueue_run, WorkerPool};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{Job, JobStatus};

/// At-least-once delivery: a claim atomically moves a job from queued to
/// claimed under a lease; expired leases make the job claimable again.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<(), EngineError>;
    /// Claim the best available job: highest priority first, oldest first
    /// within a priority. Returns `None` when nothing is claimable.
    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Job>, EngineError>;
    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), EngineError>;
    async fn ack(&self, job_id: Uuid, worker_id: &str) -> Result<(), EngineError>;
    async fn pending_len(&self) -> Result<usize, EngineError>;
}

/// In-process queue. All transitions happen under one lock, which is the
/// in-memory equivalent of the single-transaction claim the SQL-backed
/// implementation performs.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<Job>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<(), EngineError> {
        self.jobs.lock().push(job);
        Ok(())
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Job>, EngineError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock();

        // Expired leases revert to queued so another worker may reclaim.
        for job in jobs.iter_mut() {
            if job.status == JobStatus::Claimed
                && job.lease_expires_at.map(|at| at <= now).unwrap_or(false)
            {
                job.status = JobStatus::Queued;
                job.claimed_by = None;
                job.lease_expires_at = None;
            }
        }

        let best = jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Queued && job.available_at <= now)
            .max_by_key(|job| (job.priority, std::cmp::Reverse(job.created_at)));

        Ok(best.map(|job| {
            job.status = JobStatus::Claimed;
            job.claimed_by = Some(worker_id.to_string());
            job.lease_expires_at = Some(now + lease);
            job.clone()
        }))
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), EngineError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .iter_mut()
            .find(|job| job.id == job_id)
            .ok_or_else(|| EngineError::Queue(format!("job {job_id} not found")))?;
        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(EngineError::Queue(format!(
                "job {job_id} is not held by {worker_id}"
            )));
        }
        job.lease_expires_at = Some(Utc::now() + lease);
        Ok(())
    }

    async fn ack(&self, job_id: Uuid, worker_id: &str) -> Result<(), EngineError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .iter_mut()
            .find(|job| job.id == job_id)
            .ok_or_else(|| EngineError::Queue(format!("job {job_id} not found")))?;
        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(EngineError::Queue(format!(
                "job {job_id} is not held by {worker_id}"
            )));
        }
        job.status = JobStatus::Done;
        Ok(())
    }

    async fn pending_len(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        Ok(self
            .jobs
            .lock()
            .iter()
            .filter(|job| job.status == JobStatus::Queued && job.available_at <= now)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobPriority, TriggeredBy};
    use serde_json::Value;

    fn job() -> Job {
        Job::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            TriggeredBy::Manual,
            Value::Null,
        )
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(job()).await.unwrap();

        let first = queue.claim("w1", Duration::minutes(5)).await.unwrap();
        assert!(first.is_some());
        let second = queue.claim("w2", Duration::minutes(5)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_priority_then_age_ordering() {
        let queue = MemoryJobQueue::new();
        let normal = job();
        let high = job().with_priority(JobPriority::High);
        queue.enqueue(normal.clone()).await.unwrap();
        queue.enqueue(high.clone()).await.unwrap();

        let claimed = queue.claim("w1", Duration::minutes(5)).await.unwrap().unwrap();
        assert_eq!(claimed.id, high.id);
        let claimed = queue.claim("w1", Duration::minutes(5)).await.unwrap().unwrap();
        assert_eq!(claimed.id, normal.id);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(job()).await.unwrap();

        let claimed = queue.claim("w1", Duration::milliseconds(-1)).await.unwrap();
        assert!(claimed.is_some());

        // The lease is already expired, so another worker takes over.
        let reclaimed = queue.claim("w2", Duration::minutes(5)).await.unwrap();
        assert!(reclaimed.is_some());
        assert_eq!(reclaimed.unwrap().claimed_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_extend_lease_requires_holder() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(job()).await.unwrap();
        let claimed = queue.claim("w1", Duration::minutes(5)).await.unwrap().unwrap();

        assert!(queue.extend_lease(claimed.id, "w1", Duration::minutes(5)).await.is_ok());
        assert!(queue.extend_lease(claimed.id, "w2", Duration::minutes(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimable_until_available() {
        let queue = MemoryJobQueue::new();
        queue
            .enqueue(job().delayed_until(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();

        assert!(queue.claim("w1", Duration::minutes(5)).await.unwrap().is_none());
        assert_eq!(queue.pending_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ack_completes_job() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(job()).await.unwrap();
        let claimed = queue.claim("w1", Duration::minutes(5)).await.unwrap().unwrap();
        queue.ack(claimed.id, "w1").await.unwrap();

        assert!(queue.claim("w2", Duration::minutes(5)).await.unwrap().is_none());
    }
}
