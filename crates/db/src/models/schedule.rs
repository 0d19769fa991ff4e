//! Schedule entity models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use conduit_core::types::{DbId, Timestamp};

use super::status::StatusId;

/// A row from the `schedules` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Schedule {
    pub id: DbId,
    pub name: String,
    pub group_key: String,
    pub group_max_concurrency: i32,
    pub status_id: StatusId,
    pub frequency_ms: i64,
    pub payload: serde_json::Value,
    pub retry_max: i32,
    pub heartbeat_timeout_secs: Option<i32>,
    pub created_to_started_timeout_secs: Option<i32>,
    pub started_to_completed_timeout_secs: Option<i32>,
    pub allow_overlap: bool,
    pub starts_at: Timestamp,
    pub next_execution_at: Timestamp,
    pub last_scheduled_task_id: Option<DbId>,
    pub deleted_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for `POST /api/v1/schedules`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSchedule {
    pub name: String,
    pub group_key: String,
    #[serde(default)]
    pub group_max_concurrency: i32,
    /// Cadence spec such as `"60s"` or `"5 minutes"`.
    pub frequency: String,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    pub retry_max: Option<i32>,
    pub heartbeat_timeout_secs: Option<i32>,
    pub created_to_started_timeout_secs: Option<i32>,
    pub started_to_completed_timeout_secs: Option<i32>,
    #[serde(default)]
    pub allow_overlap: bool,
    /// First execution time. Defaults to now.
    pub starts_at: Option<Timestamp>,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// DTO for `PUT /api/v1/schedules/{id}`. All fields optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSchedule {
    pub frequency: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub group_max_concurrency: Option<i32>,
    pub retry_max: Option<i32>,
    pub allow_overlap: Option<bool>,
}

/// Filter for `GET /api/v1/schedules`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleSearch {
    pub names: Option<Vec<String>>,
    pub status_id: Option<StatusId>,
    pub limit: Option<i64>,
}
