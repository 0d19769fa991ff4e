//! Execution node entity models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use conduit_core::types::{DbId, Timestamp};

use super::status::StatusId;

/// A row from the `nodes` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Node {
    pub id: DbId,
    pub fleet_id: String,
    pub deployment_id: DbId,
    pub status_id: StatusId,
    pub url: Option<String>,
    pub provider_handle: Option<String>,
    pub image: String,
    pub cpu_milli: i32,
    pub memory_mb: i32,
    pub storage_mb: i32,
    pub idle_timeout_secs: i32,
    pub error: Option<String>,
    pub idle_since: Option<Timestamp>,
    pub last_dispatched_at: Option<Timestamp>,
    pub last_state_transition_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Insert DTO for a PENDING node.
#[derive(Debug, Clone)]
pub struct CreateNode {
    pub fleet_id: String,
    pub deployment_id: DbId,
    pub image: String,
    pub cpu_milli: i32,
    pub memory_mb: i32,
    pub storage_mb: i32,
    pub idle_timeout_secs: i32,
}

/// A RUNNING node joined with its in-flight task count.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NodeLoad {
    pub node_id: DbId,
    pub deployment_id: DbId,
    pub url: String,
    pub active_tasks: i64,
}

/// Optional column changes applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct NodeTransition {
    pub url: Option<String>,
    pub provider_handle: Option<String>,
    pub error: Option<String>,
}

/// Filter for `GET /api/v1/fleet/nodes`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeSearch {
    pub status_ids: Option<Vec<StatusId>>,
    pub deployment_id: Option<DbId>,
}
