//! Cron scheduler: fires due schedules into the job queue.
//!
//! Multiple replicas coexist through per-schedule advisory locks. On each
//! tick, a due schedule's `next_run_at` is advanced before its job is
//! enqueued, so a crash between the two loses at most one firing; missed
//! firings are never backfilled.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::model::{Schedule, TriggeredBy};
use crate::queue::{enqueue_run, JobQueue};
use crate::storage::{RunStore, ScheduleStore};

/// Compute the next fire time of a cron expression in the given IANA
/// timezone, strictly after `after`.
pub fn next_fire_time(
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, EngineError> {
    let cron = CronSchedule::from_str(expression).map_err(|e| EngineError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })?;
    let tz: Tz = timezone.parse().map_err(|_| EngineError::InvalidCron {
        expression: expression.to_string(),
        reason: format!("unknown timezone '{timezone}'"),
    })?;
    let local_after = tz.from_utc_datetime(&after.naive_utc());
    Ok(cron.after(&local_after).next().map(|at| at.with_timezone(&Utc)))
}

pub struct Scheduler {
    schedule_store: Arc<dyn ScheduleStore>,
    run_store: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
    tick_interval: StdDuration,
    batch_size: usize,
}

impl Scheduler {
    pub fn new(
        schedule_store: Arc<dyn ScheduleStore>,
        run_store: Arc<dyn RunStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            schedule_store,
            run_store,
            queue,
            tick_interval: StdDuration::from_secs(10),
            batch_size: 100,
        }
    }

    pub fn with_tick_interval(mut self, interval: StdDuration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Register a schedule, computing its first fire time.
    pub async fn register(&self, mut schedule: Schedule) -> Result<Schedule, EngineError> {
        schedule.next_run_at =
            next_fire_time(&schedule.cron_expression, &schedule.timezone, Utc::now())?;
        self.schedule_store.put_schedule(schedule.clone()).await?;
        Ok(schedule)
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(tick_ms = self.tick_interval.as_millis() as u64, "scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.tick_interval) => {
                        if let Err(err) = self.tick(Utc::now()).await {
                            warn!(error = %err, "scheduler tick failed");
                        }
                    }
                }
            }
            info!("scheduler stopped");
        })
    }

    /// Fire every due schedule once: advance `next_run_at`, then enqueue.
    /// Returns the number of jobs enqueued.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let due = self.schedule_store.list_due(now, self.batch_size).await?;
        let mut fired = 0;
        for schedule in due {
            if !self.schedule_store.try_lock(schedule.id).await? {
                continue;
            }
            let result = self.fire(schedule, now).await;
            // The lock spans the advance+enqueue pair only.
            if let Err(err) = &result {
                warn!(error = %err, "schedule firing failed");
            } else {
                fired += 1;
            }
        }
        Ok(fired)
    }

    async fn fire(&self, mut schedule: Schedule, now: DateTime<Utc>) -> Result<(), EngineError> {
        let schedule_id = schedule.id;
        let result = async {
            // Advance before enqueue: a crash in between loses at most this
            // one firing.
            let next = next_fire_time(&schedule.cron_expression, &schedule.timezone, now)?;
            schedule.record_fire(next);
            self.schedule_store.put_schedule(schedule.clone()).await?;

            let run = enqueue_run(
                &self.run_store,
                &self.queue,
                schedule.tenant_id,
                schedule.project_id,
                0,
                schedule.start_step_id,
                TriggeredBy::Schedule,
                schedule.input.clone(),
            )
            .await?;
            info!(
                schedule_id = %schedule.id,
                run_id = %run.id,
                next_run_at = ?schedule.next_run_at,
                "schedule fired"
            );
            Ok(())
        }
        .await;
        self.schedule_store.unlock(schedule_id).await?;
        result
    }
}
