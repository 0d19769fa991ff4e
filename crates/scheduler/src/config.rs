//! Scheduler and task-default configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use conduit_core::scheduling::{
    DEFAULT_RETRY_BACKOFF_BASE_SECS, DEFAULT_RETRY_BACKOFF_MAX_SECS, DEFAULT_RETRY_MAX,
};
use conduit_db::repositories::RetryBackoff;

/// Scheduling loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub lease_ttl: Duration,
    pub lease_key: String,
    /// Heartbeat timeout for STARTED tasks without a per-task override.
    pub heartbeat_timeout: Duration,
    pub dispatch_batch_size: i64,
    pub promotion_batch_size: i64,
    /// Terminal tasks older than this are pruned.
    pub task_retention: Duration,
    /// How often the prune step runs.
    pub prune_interval: Duration,
    pub task_defaults: TaskDefaults,
}

/// Defaults applied to tasks that do not set their own retry policy.
#[derive(Debug, Clone)]
pub struct TaskDefaults {
    pub retry_max: i32,
    pub retry_backoff: RetryBackoff,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            retry_max: DEFAULT_RETRY_MAX,
            retry_backoff: RetryBackoff {
                base: Duration::from_secs(DEFAULT_RETRY_BACKOFF_BASE_SECS),
                max: Duration::from_secs(DEFAULT_RETRY_BACKOFF_MAX_SECS),
            },
        }
    }
}

impl TaskDefaults {
    /// | Env Var                          | Default |
    /// |----------------------------------|---------|
    /// | `TASK_RETRY_MAX_DEFAULT`         | `3`     |
    /// | `TASK_RETRY_BACKOFF_BASE_SECS`   | `5`     |
    /// | `TASK_RETRY_BACKOFF_MAX_SECS`    | `3600`  |
    pub fn from_env() -> Self {
        Self {
            retry_max: env_or("TASK_RETRY_MAX_DEFAULT", DEFAULT_RETRY_MAX),
            retry_backoff: RetryBackoff {
                base: Duration::from_secs(env_or(
                    "TASK_RETRY_BACKOFF_BASE_SECS",
                    DEFAULT_RETRY_BACKOFF_BASE_SECS,
                )),
                max: Duration::from_secs(env_or(
                    "TASK_RETRY_BACKOFF_MAX_SECS",
                    DEFAULT_RETRY_BACKOFF_MAX_SECS,
                )),
            },
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1000),
            lease_ttl: Duration::from_secs(10),
            lease_key: "scheduler".into(),
            heartbeat_timeout: Duration::from_secs(60),
            dispatch_batch_size: 100,
            promotion_batch_size: 100,
            task_retention: Duration::from_secs(7 * 86_400),
            prune_interval: Duration::from_secs(3600),
            task_defaults: TaskDefaults::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default     |
    /// |----------------------------------|-------------|
    /// | `SCHEDULER_TICK_MS`              | `1000`      |
    /// | `LEADER_LEASE_TTL_SECS`          | `10`        |
    /// | `LEADER_LEASE_KEY`               | `scheduler` |
    /// | `TASK_HEARTBEAT_TIMEOUT_SECS`    | `60`        |
    /// | `DISPATCH_BATCH_SIZE`            | `100`       |
    /// | `SCHEDULE_PROMOTION_BATCH_SIZE`  | `100`       |
    /// | `TASK_RETENTION_DAYS`            | `7`         |
    pub fn from_env() -> Self {
        let tick_interval = Duration::from_millis(env_or("SCHEDULER_TICK_MS", 1000));
        let lease_ttl = Duration::from_secs(env_or("LEADER_LEASE_TTL_SECS", 10));
        assert!(
            lease_ttl > tick_interval,
            "LEADER_LEASE_TTL_SECS must be longer than SCHEDULER_TICK_MS"
        );
        let retention_days: u64 = env_or("TASK_RETENTION_DAYS", 7);

        Self {
            tick_interval,
            lease_ttl,
            lease_key: env_or("LEADER_LEASE_KEY", "scheduler".to_string()),
            heartbeat_timeout: Duration::from_secs(env_or("TASK_HEARTBEAT_TIMEOUT_SECS", 60)),
            dispatch_batch_size: env_or("DISPATCH_BATCH_SIZE", 100),
            promotion_batch_size: env_or("SCHEDULE_PROMOTION_BATCH_SIZE", 100),
            task_retention: Duration::from_secs(retention_days * 86_400),
            prune_interval: Duration::from_secs(3600),
            task_defaults: TaskDefaults::from_env(),
        }
    }
}

fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|e| panic!("{name} is invalid: {e}")),
        Err(_) => default,
    }
}
