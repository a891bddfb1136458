//! Cron schedule entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Cron-driven trigger bound to a start step of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub project_id: Uuid,
    pub start_step_id: Uuid,
    pub name: String,
    pub cron_expression: String,
    /// IANA timezone name, e.g. `Asia/Tokyo`.
    pub timezone: String,
    #[serde(default)]
    pub input: Value,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        tenant_id: Uuid,
        project_id: Uuid,
        start_step_id: Uuid,
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            project_id,
            start_step_id,
            name: name.into(),
            cron_expression: cron_expression.into(),
            timezone: timezone.into(),
            input: Value::Object(Default::default()),
            enabled: true,
            next_run_at: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.map(|at| at <= now).unwrap_or(false)
    }

    pub fn record_fire(&mut self, next: Option<DateTime<Utc>>) {
        let now = Utc::now();
        self.last_run_at = Some(now);
        self.next_run_at = next;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn schedule() -> Schedule {
        Schedule::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "nightly",
            "0 0 2 * * *",
            "UTC",
        )
    }

    #[test]
    fn test_due_only_when_enabled_and_elapsed() {
        let now = Utc::now();
        let mut s = schedule();
        assert!(!s.is_due(now));

        s.next_run_at = Some(now - Duration::seconds(1));
        assert!(s.is_due(now));

        s.enabled = false;
        assert!(!s.is_due(now));
    }

    #[test]
    fn test_record_fire_advances() {
        let mut s = schedule();
        let next = Utc::now() + Duration::hours(24);
        s.record_fire(Some(next));
        assert_eq!(s.next_run_at, Some(next));
        assert!(s.last_run_at.is_some());
    }
}
