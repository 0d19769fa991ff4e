//! Repository for the `node_config_overrides` table.

use sqlx::PgPool;

use crate::models::node_config_override::{NodeConfigOverride, UpsertNodeConfigOverride};

/// Column list for `node_config_overrides` queries.
const COLUMNS: &str = "\
    id, fleet_id, image, cpu_milli, memory_mb, storage_mb, idle_timeout_secs, \
    created_at, updated_at";

/// Provides per-fleet node configuration overrides.
pub struct NodeConfigOverrideRepo;

impl NodeConfigOverrideRepo {
    pub async fn find(
        pool: &PgPool,
        fleet_id: &str,
    ) -> Result<Option<NodeConfigOverride>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM node_config_overrides WHERE fleet_id = $1");
        sqlx::query_as::<_, NodeConfigOverride>(&query)
            .bind(fleet_id)
            .fetch_optional(pool)
            .await
    }

    /// Insert or replace the fleet's override. Absent fields clear the
    /// corresponding override.
    pub async fn upsert(
        pool: &PgPool,
        fleet_id: &str,
        input: &UpsertNodeConfigOverride,
    ) -> Result<NodeConfigOverride, sqlx::Error> {
        let query = format!(
            "INSERT INTO node_config_overrides \
                 (fleet_id, image, cpu_milli, memory_mb, storage_mb, idle_timeout_secs) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (fleet_id) DO UPDATE \
             SET image = EXCLUDED.image, \
                 cpu_milli = EXCLUDED.cpu_milli, \
                 memory_mb = EXCLUDED.memory_mb, \
                 storage_mb = EXCLUDED.storage_mb, \
                 idle_timeout_secs = EXCLUDED.idle_timeout_secs, \
                 updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, NodeConfigOverride>(&query)
            .bind(fleet_id)
            .bind(input.image.as_deref())
            .bind(input.cpu_milli)
            .bind(input.memory_mb)
            .bind(input.storage_mb)
            .bind(input.idle_timeout_secs)
            .fetch_one(pool)
            .await
    }

    /// Remove the fleet's override. Returns `false` if none existed.
    pub async fn delete(pool: &PgPool, fleet_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM node_config_overrides WHERE fleet_id = $1")
            .bind(fleet_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
