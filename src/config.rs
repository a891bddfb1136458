//! Environment-derived engine settings.

use std::env;
use std::time::Duration;

use tracing::info;

use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    pub auth_enabled: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub bind_addr: String,
    pub sandbox_timeout: Duration,
    pub worker_concurrency: usize,
    pub scheduler_tick: Duration,
    pub webhook_clock_skew_seconds: i64,
    pub idempotency_ttl_hours: i64,
    pub inheritance_max_depth: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auth_enabled: false,
            database_url: None,
            redis_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            sandbox_timeout: Duration::from_millis(30_000),
            worker_concurrency: 4,
            scheduler_tick: Duration::from_millis(10_000),
            webhook_clock_skew_seconds: 300,
            idempotency_ttl_hours: 24,
            inheritance_max_depth: 50,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let settings = Self {
            auth_enabled: env_bool("AUTH_ENABLED", defaults.auth_enabled),
            database_url: env::var("DATABASE_URL").ok(),
            redis_url: env::var("REDIS_URL").ok(),
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            sandbox_timeout: Duration::from_millis(env_num(
                "SANDBOX_TIMEOUT_MS",
                defaults.sandbox_timeout.as_millis() as u64,
            )),
            worker_concurrency: env_num("WORKER_CONCURRENCY", defaults.worker_concurrency as u64)
                .max(1) as usize,
            scheduler_tick: Duration::from_millis(env_num(
                "SCHEDULER_TICK_MS",
                defaults.scheduler_tick.as_millis() as u64,
            )),
            webhook_clock_skew_seconds: env_num(
                "WEBHOOK_CLOCK_SKEW_SECONDS",
                defaults.webhook_clock_skew_seconds as u64,
            ) as i64,
            idempotency_ttl_hours: env_num(
                "IDEMPOTENCY_TTL_HOURS",
                defaults.idempotency_ttl_hours as u64,
            ) as i64,
            inheritance_max_depth: env_num(
                "INHERITANCE_MAX_DEPTH",
                defaults.inheritance_max_depth as u64,
            ) as usize,
            rate_limit: RateLimitConfig {
                enabled: env_bool("RATE_LIMIT_ENABLED", defaults.rate_limit.enabled),
                tenant_per_minute: env_num(
                    "RATE_LIMIT_TENANT",
                    defaults.rate_limit.tenant_per_minute as u64,
                ) as u32,
                project_per_minute: env_num(
                    "RATE_LIMIT_PROJECT",
                    defaults.rate_limit.project_per_minute as u64,
                ) as u32,
                webhook_per_minute: env_num(
                    "RATE_LIMIT_WEBHOOK",
                    defaults.rate_limit.webhook_per_minute as u64,
                ) as u32,
            },
        };
        info!(
            worker_concurrency = settings.worker_concurrency,
            sandbox_timeout_ms = settings.sandbox_timeout.as_millis() as u64,
            scheduler_tick_ms = settings.scheduler_tick.as_millis() as u64,
            rate_limit_enabled = settings.rate_limit.enabled,
            "settings loaded"
        );
        settings
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_num(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
