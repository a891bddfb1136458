//! Token-bucket rate limiting per {scope, key}.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Tenant,
    Project,
    Webhook,
}

impl LimitScope {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitScope::Tenant => "tenant",
            LimitScope::Project => "project",
            LimitScope::Webhook => "webhook",
        }
    }
}

/// Bucket capacity per scope; refill defaults to capacity per minute.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub tenant_per_minute: u32,
    pub project_per_minute: u32,
    pub webhook_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tenant_per_minute: 600,
            project_per_minute: 300,
            webhook_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
    updated_at: DateTime<Utc>,
}

impl Bucket {
    fn new(per_minute: u32, now: DateTime<Utc>) -> Self {
        let capacity = per_minute as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / 60.0,
            updated_at: now,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.updated_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.updated_at = now;
    }

    fn try_take(&mut self, now: DateTime<Utc>) -> Result<u32, DateTime<Utc>> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(self.tokens as u32)
        } else {
            let deficit = 1.0 - self.tokens;
            let wait_ms = (deficit / self.refill_rate * 1000.0).ceil() as i64;
            Err(now + Duration::milliseconds(wait_ms))
        }
    }
}

/// Outcome of a rate-limit check, carrying the header values the API layer
/// surfaces.
#[derive(Debug, Clone)]
pub struct LimitDecision {
    pub allowed: bool,
    pub scope: LimitScope,
    pub limit: u32,
    pub remaining: u32,
    /// When a denied caller may retry.
    pub retry_at: Option<DateTime<Utc>>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<(LimitScope, String), Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn capacity(&self, scope: LimitScope) -> u32 {
        match scope {
            LimitScope::Tenant => self.config.tenant_per_minute,
            LimitScope::Project => self.config.project_per_minute,
            LimitScope::Webhook => self.config.webhook_per_minute,
        }
    }

    /// Take one token from the bucket for (scope, key).
    pub fn check(&self, scope: LimitScope, key: &str) -> LimitDecision {
        self.check_at(scope, key, Utc::now())
    }

    pub fn check_at(&self, scope: LimitScope, key: &str, now: DateTime<Utc>) -> LimitDecision {
        let limit = self.capacity(scope);
        if !self.config.enabled {
            return LimitDecision {
                allowed: true,
                scope,
                limit,
                remaining: limit,
                retry_at: None,
            };
        }

        let mut bucket = self
            .buckets
            .entry((scope, key.to_string()))
            .or_insert_with(|| Bucket::new(limit, now));

        match bucket.try_take(now) {
            Ok(remaining) => LimitDecision {
                allowed: true,
                scope,
                limit,
                remaining,
                retry_at: None,
            },
            Err(retry_at) => LimitDecision {
                allowed: false,
                scope,
                limit,
                remaining: 0,
                retry_at: Some(retry_at),
            },
        }
    }

    /// Serialize bucket state for periodic persistence. Transient loss of a
    /// snapshot only forgets recent consumption.
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.buckets
            .iter()
            .filter_map(|entry| {
                let (scope, key) = entry.key();
                serde_json::to_value(entry.value())
                    .ok()
                    .map(|v| (format!("{}:{key}", scope.as_str()), v))
            })
            .collect()
    }

    pub fn restore(&self, snapshot: HashMap<String, serde_json::Value>) {
        for (compound, value) in snapshot {
            let Some((scope_raw, key)) = compound.split_once(':') else {
                continue;
            };
            let scope = match scope_raw {
                "tenant" => LimitScope::Tenant,
                "project" => LimitScope::Project,
                "webhook" => LimitScope::Webhook,
                _ => continue,
            };
            if let Ok(bucket) = serde_json::from_value::<Bucket>(value) {
                self.buckets.insert((scope, key.to_string()), bucket);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            tenant_per_minute: per_minute,
            project_per_minute: per_minute,
            webhook_per_minute: per_minute,
        })
    }

    #[test]
    fn test_tokens_exhaust_then_deny() {
        let limiter = limiter(3);
        let now = Utc::now();
        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_at(LimitScope::Webhook, "hook-1", now);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let denied = limiter.check_at(LimitScope::Webhook, "hook-1", now);
        assert!(!denied.allowed);
        assert!(denied.retry_at.unwrap() > now);
        assert_eq!(denied.limit, 3);
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = limiter(60); // one token per second
        let now = Utc::now();
        for _ in 0..60 {
            assert!(limiter.check_at(LimitScope::Tenant, "t", now).allowed);
        }
        assert!(!limiter.check_at(LimitScope::Tenant, "t", now).allowed);

        // Two seconds later two tokens are back.
        let later = now + Duration::seconds(2);
        assert!(limiter.check_at(LimitScope::Tenant, "t", later).allowed);
        assert!(limiter.check_at(LimitScope::Tenant, "t", later).allowed);
        assert!(!limiter.check_at(LimitScope::Tenant, "t", later).allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1);
        let now = Utc::now();
        assert!(limiter.check_at(LimitScope::Project, "a", now).allowed);
        assert!(!limiter.check_at(LimitScope::Project, "a", now).allowed);
        assert!(limiter.check_at(LimitScope::Project, "b", now).allowed);
    }

    #[test]
    fn test_disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            tenant_per_minute: 1,
            project_per_minute: 1,
            webhook_per_minute: 1,
        });
        let now = Utc::now();
        for _ in 0..10 {
            assert!(limiter.check_at(LimitScope::Tenant, "t", now).allowed);
        }
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let first = limiter(5);
        let now = Utc::now();
        first.check_at(LimitScope::Webhook, "hook", now);
        first.check_at(LimitScope::Webhook, "hook", now);

        let second = limiter(5);
        second.restore(first.snapshot());
        let decision = second.check_at(LimitScope::Webhook, "hook", now);
        // 5 - 2 consumed - 1 now = 2 remaining.
        assert_eq!(decision.remaining, 2);
    }
}
