//! Repository for the `nodes` table.
//!
//! Node state changes are compare-and-set updates on the expected current
//! status, so a supervisor and the idle callback can race without locks.

use sqlx::PgPool;
use conduit_core::fleet::node_state_machine;
use conduit_core::types::{DbId, Timestamp};

use crate::models::node::{CreateNode, Node, NodeLoad, NodeSearch, NodeTransition};
use crate::models::status::{NodeStatus, StatusId, TaskStatus};

/// Column list for `nodes` queries.
const COLUMNS: &str = "\
    id, fleet_id, deployment_id, status_id, url, provider_handle, image, \
    cpu_milli, memory_mb, storage_mb, idle_timeout_secs, error, idle_since, \
    last_dispatched_at, last_state_transition_at, created_at, updated_at";

/// Provides persistence and lifecycle transitions for execution nodes.
pub struct NodeRepo;

impl NodeRepo {
    /// Insert a node in PENDING.
    pub async fn create(pool: &PgPool, input: &CreateNode) -> Result<Node, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        Self::insert(&mut *conn, input).await
    }

    /// Insert a PENDING node within a caller-owned transaction.
    pub async fn create_in(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        input: &CreateNode,
    ) -> Result<Node, sqlx::Error> {
        Self::insert(&mut **tx, input).await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Node>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM nodes WHERE id = $1");
        sqlx::query_as::<_, Node>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Nodes of a fleet, optionally filtered by status and deployment.
    pub async fn search(
        pool: &PgPool,
        fleet_id: &str,
        params: &NodeSearch,
    ) -> Result<Vec<Node>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM nodes \
             WHERE fleet_id = $1 \
               AND ($2::SMALLINT[] IS NULL OR status_id = ANY($2)) \
               AND ($3::BIGINT IS NULL OR deployment_id = $3) \
             ORDER BY id"
        );
        sqlx::query_as::<_, Node>(&query)
            .bind(fleet_id)
            .bind(params.status_ids.as_deref())
            .bind(params.deployment_id)
            .fetch_all(pool)
            .await
    }

    /// Every node of a fleet that has not been removed.
    pub async fn list_for_fleet(pool: &PgPool, fleet_id: &str) -> Result<Vec<Node>, sqlx::Error> {
        Self::search(pool, fleet_id, &NodeSearch::default()).await
    }

    /// Move a node from `from` to `to` if it is still in `from`.
    ///
    /// Returns `None` when the node changed state underneath the caller or
    /// the transition is not part of the node lifecycle. Any transition
    /// clears `idle_since`.
    pub async fn transition(
        pool: &PgPool,
        id: DbId,
        from: NodeStatus,
        to: NodeStatus,
        changes: &NodeTransition,
    ) -> Result<Option<Node>, sqlx::Error> {
        if !node_state_machine::can_transition(from.id(), to.id()) {
            tracing::warn!(node_id = id, %from, %to, "Rejected invalid node transition");
            return Ok(None);
        }

        let query = format!(
            "UPDATE nodes \
             SET status_id = $3, \
                 url = COALESCE($4, url), \
                 provider_handle = COALESCE($5, provider_handle), \
                 error = COALESCE($6, error), \
                 idle_since = NULL, \
                 last_state_transition_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = $1 AND status_id = $2 \
             RETURNING {COLUMNS}"
        );
        let node = sqlx::query_as::<_, Node>(&query)
            .bind(id)
            .bind(from.id())
            .bind(to.id())
            .bind(changes.url.as_deref())
            .bind(changes.provider_handle.as_deref())
            .bind(changes.error.as_deref())
            .fetch_optional(pool)
            .await?;

        if let Some(node) = &node {
            tracing::info!(node_id = node.id, %from, %to, "Node transitioned");
        }
        Ok(node)
    }

    /// RUNNING nodes with a URL, joined with their STARTED task counts.
    pub async fn running_loads(
        pool: &PgPool,
        fleet_id: &str,
    ) -> Result<Vec<NodeLoad>, sqlx::Error> {
        sqlx::query_as::<_, NodeLoad>(
            "SELECT n.id AS node_id, n.deployment_id, n.url, COUNT(t.id) AS active_tasks \
             FROM nodes n \
             LEFT JOIN tasks t ON t.node_id = n.id AND t.status_id = $3 \
             WHERE n.fleet_id = $1 AND n.status_id = $2 AND n.url IS NOT NULL \
             GROUP BY n.id \
             ORDER BY n.id",
        )
        .bind(fleet_id)
        .bind(NodeStatus::Running.id())
        .bind(TaskStatus::Started.id())
        .fetch_all(pool)
        .await
    }

    /// STARTED task counts per node for every node of the fleet that has any.
    pub async fn in_flight_counts(
        pool: &PgPool,
        fleet_id: &str,
    ) -> Result<Vec<(DbId, i64)>, sqlx::Error> {
        sqlx::query_as(
            "SELECT t.node_id, COUNT(*) \
             FROM tasks t \
             JOIN nodes n ON n.id = t.node_id \
             WHERE n.fleet_id = $1 AND t.status_id = $2 \
             GROUP BY t.node_id",
        )
        .bind(fleet_id)
        .bind(TaskStatus::Started.id())
        .fetch_all(pool)
        .await
    }

    /// Stamp the start of an idle period on a RUNNING node. An existing
    /// stamp is kept. Returns `false` if the node is not RUNNING.
    pub async fn mark_idle_since(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE nodes SET idle_since = COALESCE(idle_since, NOW()), updated_at = NOW() \
             WHERE id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(NodeStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record that a task was routed to the node; ends any idle period.
    pub async fn record_dispatch(pool: &PgPool, id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE nodes SET last_dispatched_at = NOW(), idle_since = NULL, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Delete TERMINATED nodes whose last transition is older than `older_than`.
    pub async fn remove_terminated(
        pool: &PgPool,
        fleet_id: &str,
        older_than: Timestamp,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM nodes \
             WHERE fleet_id = $1 AND status_id = $2 AND last_state_transition_at < $3",
        )
        .bind(fleet_id)
        .bind(NodeStatus::Terminated.id())
        .bind(older_than)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Count nodes per status, for diagnostics.
    pub async fn count_by_status(
        pool: &PgPool,
        fleet_id: &str,
    ) -> Result<Vec<(StatusId, i64)>, sqlx::Error> {
        sqlx::query_as(
            "SELECT status_id, COUNT(*) FROM nodes WHERE fleet_id = $1 \
             GROUP BY status_id ORDER BY status_id",
        )
        .bind(fleet_id)
        .fetch_all(pool)
        .await
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn insert(conn: &mut sqlx::PgConnection, input: &CreateNode) -> Result<Node, sqlx::Error> {
        let query = format!(
            "INSERT INTO nodes \
                 (fleet_id, deployment_id, status_id, image, cpu_milli, memory_mb, \
                  storage_mb, idle_timeout_secs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Node>(&query)
            .bind(&input.fleet_id)
            .bind(input.deployment_id)
            .bind(NodeStatus::Pending.id())
            .bind(&input.image)
            .bind(input.cpu_milli)
            .bind(input.memory_mb)
            .bind(input.storage_mb)
            .bind(input.idle_timeout_secs)
            .fetch_one(conn)
            .await
    }
}
