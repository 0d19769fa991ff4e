//! Per-fleet node configuration overrides.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use conduit_core::types::{DbId, Timestamp};

/// A row from the `node_config_overrides` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NodeConfigOverride {
    pub id: DbId,
    pub fleet_id: String,
    pub image: Option<String>,
    pub cpu_milli: Option<i32>,
    pub memory_mb: Option<i32>,
    pub storage_mb: Option<i32>,
    pub idle_timeout_secs: Option<i32>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Upsert DTO for `PUT /api/v1/fleet/config-override`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpsertNodeConfigOverride {
    pub image: Option<String>,
    pub cpu_milli: Option<i32>,
    pub memory_mb: Option<i32>,
    pub storage_mb: Option<i32>,
    pub idle_timeout_secs: Option<i32>,
}
