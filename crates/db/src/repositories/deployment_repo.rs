//! Repository for the `deployments` table.

use sqlx::PgPool;
use conduit_core::types::DbId;

use crate::models::deployment::{CreateDeployment, Deployment};

/// Column list for `deployments` queries.
const COLUMNS: &str = "id, fleet_id, commit_hash, image, superseded_at, created_at, updated_at";

/// A newly activated deployment and the one it replaced.
#[derive(Debug)]
pub struct Activation {
    pub deployment: Deployment,
    pub superseded: Option<Deployment>,
}

/// Provides persistence for fleet deployments.
pub struct DeploymentRepo;

impl DeploymentRepo {
    /// Supersede the fleet's active deployment and insert the new one, in
    /// one transaction. The partial unique index on active deployments
    /// rejects a concurrent second activation.
    pub async fn activate(
        pool: &PgPool,
        fleet_id: &str,
        input: &CreateDeployment,
    ) -> Result<Activation, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let activation = Self::activate_in(&mut tx, fleet_id, input).await?;
        tx.commit().await?;
        Ok(activation)
    }

    /// [`activate`](Self::activate) within a caller-owned transaction, so
    /// the new deployment can be committed together with its first nodes.
    pub async fn activate_in(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        fleet_id: &str,
        input: &CreateDeployment,
    ) -> Result<Activation, sqlx::Error> {
        let query = format!(
            "UPDATE deployments SET superseded_at = NOW(), updated_at = NOW() \
             WHERE fleet_id = $1 AND superseded_at IS NULL \
             RETURNING {COLUMNS}"
        );
        let superseded = sqlx::query_as::<_, Deployment>(&query)
            .bind(fleet_id)
            .fetch_optional(&mut **tx)
            .await?;

        let query = format!(
            "INSERT INTO deployments (fleet_id, commit_hash, image) \
             VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        let deployment = sqlx::query_as::<_, Deployment>(&query)
            .bind(fleet_id)
            .bind(&input.commit_hash)
            .bind(&input.image)
            .fetch_one(&mut **tx)
            .await?;

        Ok(Activation {
            deployment,
            superseded,
        })
    }

    /// The fleet's active deployment, if any has been rolled out.
    pub async fn find_active(
        pool: &PgPool,
        fleet_id: &str,
    ) -> Result<Option<Deployment>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM deployments \
             WHERE fleet_id = $1 AND superseded_at IS NULL"
        );
        sqlx::query_as::<_, Deployment>(&query)
            .bind(fleet_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Deployment>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM deployments WHERE id = $1");
        sqlx::query_as::<_, Deployment>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Most recent deployments of a fleet, newest first.
    pub async fn list(
        pool: &PgPool,
        fleet_id: &str,
        limit: i64,
    ) -> Result<Vec<Deployment>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM deployments \
             WHERE fleet_id = $1 \
             ORDER BY id DESC \
             LIMIT $2"
        );
        sqlx::query_as::<_, Deployment>(&query)
            .bind(fleet_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }
}
