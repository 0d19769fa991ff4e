//! Task entity models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use conduit_core::types::{DbId, Timestamp};

use super::status::StatusId;

/// A row from the `tasks` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Task {
    pub id: DbId,
    pub name: String,
    pub group_key: String,
    pub group_max_concurrency: i32,
    pub payload: serde_json::Value,
    pub status_id: StatusId,
    pub output: Option<serde_json::Value>,
    pub retry_count: i32,
    pub retry_max: i32,
    pub heartbeat_timeout_secs: Option<i32>,
    pub created_to_started_timeout_secs: Option<i32>,
    pub started_to_completed_timeout_secs: Option<i32>,
    pub schedule_id: Option<DbId>,
    pub retry_of_task_id: Option<DbId>,
    pub node_id: Option<DbId>,
    pub starting_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub last_heartbeat_at: Option<Timestamp>,
    pub last_state_transition_at: Timestamp,
    pub terminated_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for creating a task, either ad hoc via `POST /api/v1/tasks` or by
/// schedule promotion.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    pub name: String,
    pub group_key: String,
    /// `0` means unlimited.
    #[serde(default)]
    pub group_max_concurrency: i32,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    /// Earliest start. Defaults to now.
    pub starting_at: Option<Timestamp>,
    /// Falls back to the configured default when absent.
    pub retry_max: Option<i32>,
    pub heartbeat_timeout_secs: Option<i32>,
    pub created_to_started_timeout_secs: Option<i32>,
    pub started_to_completed_timeout_secs: Option<i32>,
    #[serde(skip)]
    pub schedule_id: Option<DbId>,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Filter for `GET /api/v1/tasks`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskSearch {
    pub ids: Option<Vec<DbId>>,
    pub group_key: Option<String>,
    pub status_ids: Option<Vec<StatusId>>,
    pub schedule_id: Option<DbId>,
    /// Maximum number of results. Defaults to 100, capped at 1000.
    pub limit: Option<i64>,
}

/// Result reported by the executing node for a STARTED task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
}

/// Per-group concurrency snapshot used by diagnostics and tests.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GroupLoad {
    pub group_key: String,
    pub started: i64,
    pub created: i64,
}

/// Why a task was moved to EXPIRED; recorded in `output.reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    CreatedToStartedTimeout,
    StartedToCompletedTimeout,
    HeartbeatTimeout,
}

impl ExpiryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExpiryReason::CreatedToStartedTimeout => "created_to_started_timeout_exceeded",
            ExpiryReason::StartedToCompletedTimeout => "started_to_completed_timeout_exceeded",
            ExpiryReason::HeartbeatTimeout => "heartbeat_timeout_exceeded",
        }
    }
}

impl Task {
    /// Decide whether this task has overstayed one of its windows at `now`.
    ///
    /// `default_heartbeat_timeout_secs` applies when the row carries no
    /// override. A STARTED task that never heartbeat is measured from
    /// `started_at`.
    pub fn expiry_reason(
        &self,
        now: Timestamp,
        default_heartbeat_timeout_secs: i64,
    ) -> Option<ExpiryReason> {
        use super::status::TaskStatus;
        let secs = |s: i64| chrono::TimeDelta::seconds(s);

        match TaskStatus::from_id(self.status_id)? {
            TaskStatus::Created => {
                let limit = self.created_to_started_timeout_secs?;
                (self.created_at + secs(limit.into()) < now)
                    .then_some(ExpiryReason::CreatedToStartedTimeout)
            }
            TaskStatus::Started => {
                let started_at = self.started_at.unwrap_or(self.last_state_transition_at);
                if let Some(limit) = self.started_to_completed_timeout_secs {
                    if started_at + secs(limit.into()) < now {
                        return Some(ExpiryReason::StartedToCompletedTimeout);
                    }
                }
                let beat = self.last_heartbeat_at.unwrap_or(started_at);
                let limit = self
                    .heartbeat_timeout_secs
                    .map(i64::from)
                    .unwrap_or(default_heartbeat_timeout_secs);
                (beat + secs(limit) < now).then_some(ExpiryReason::HeartbeatTimeout)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::status::TaskStatus;
    use chrono::{TimeDelta, Utc};

    fn task(status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: 1,
            name: "sync".into(),
            group_key: "g1".into(),
            group_max_concurrency: 0,
            payload: serde_json::json!({}),
            status_id: status.id(),
            output: None,
            retry_count: 0,
            retry_max: 3,
            heartbeat_timeout_secs: None,
            created_to_started_timeout_secs: None,
            started_to_completed_timeout_secs: None,
            schedule_id: None,
            retry_of_task_id: None,
            node_id: None,
            starting_at: now,
            started_at: None,
            last_heartbeat_at: None,
            last_state_transition_at: now,
            terminated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn fresh_started_task_is_not_expired() {
        let mut t = task(TaskStatus::Started);
        t.started_at = Some(Utc::now());
        t.last_heartbeat_at = t.started_at;
        assert_eq!(t.expiry_reason(Utc::now(), 60), None);
    }

    #[test]
    fn stale_heartbeat_expires() {
        let mut t = task(TaskStatus::Started);
        let then = Utc::now() - TimeDelta::seconds(120);
        t.started_at = Some(then);
        t.last_heartbeat_at = Some(then);
        assert_eq!(
            t.expiry_reason(Utc::now(), 60),
            Some(ExpiryReason::HeartbeatTimeout)
        );
    }

    #[test]
    fn per_task_heartbeat_override_wins() {
        let mut t = task(TaskStatus::Started);
        let then = Utc::now() - TimeDelta::seconds(120);
        t.started_at = Some(then);
        t.last_heartbeat_at = Some(then);
        t.heartbeat_timeout_secs = Some(600);
        assert_eq!(t.expiry_reason(Utc::now(), 60), None);
    }

    #[test]
    fn run_time_limit_checked_before_heartbeat() {
        let mut t = task(TaskStatus::Started);
        t.started_at = Some(Utc::now() - TimeDelta::seconds(30));
        t.last_heartbeat_at = Some(Utc::now());
        t.started_to_completed_timeout_secs = Some(10);
        assert_eq!(
            t.expiry_reason(Utc::now(), 60),
            Some(ExpiryReason::StartedToCompletedTimeout)
        );
    }

    #[test]
    fn created_task_only_expires_with_explicit_window() {
        let mut t = task(TaskStatus::Created);
        t.created_at = Utc::now() - TimeDelta::days(1);
        assert_eq!(t.expiry_reason(Utc::now(), 60), None);

        t.created_to_started_timeout_secs = Some(60);
        assert_eq!(
            t.expiry_reason(Utc::now(), 60),
            Some(ExpiryReason::CreatedToStartedTimeout)
        );
    }

    #[test]
    fn terminal_tasks_never_expire() {
        let mut t = task(TaskStatus::Succeeded);
        t.last_heartbeat_at = Some(Utc::now() - TimeDelta::days(1));
        assert_eq!(t.expiry_reason(Utc::now(), 60), None);
    }
}
