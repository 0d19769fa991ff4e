//! Repository for the `tasks` table.
//!
//! Every state change is a conditional update on the current `status_id`
//! (or runs under a row lock), so concurrent callers race safely: whichever
//! write lands first wins and the loser observes the new state.

use std::time::Duration;

use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use conduit_core::scheduling::{
    retry_backoff, task_state_machine, DEFAULT_RETRY_BACKOFF_BASE_SECS,
    DEFAULT_RETRY_BACKOFF_MAX_SECS, DEFAULT_RETRY_MAX,
};
use conduit_core::types::{DbId, Timestamp};

use crate::models::status::{TaskStatus, TERMINAL_TASK_STATUSES};
use crate::models::task::{CreateTask, ExpiryReason, GroupLoad, Task, TaskOutcome, TaskSearch};
use crate::repositories::leader_lock_repo::{FencedError, LeaderFence, LeaderLockRepo};

/// Column list for `tasks` queries.
const COLUMNS: &str = "\
    id, name, group_key, group_max_concurrency, payload, status_id, output, \
    retry_count, retry_max, heartbeat_timeout_secs, \
    created_to_started_timeout_secs, started_to_completed_timeout_secs, \
    schedule_id, retry_of_task_id, node_id, \
    starting_at, started_at, last_heartbeat_at, last_state_transition_at, terminated_at, \
    created_at, updated_at";

/// Maximum page size for task search.
const MAX_LIMIT: i64 = 1000;

/// Default page size for task search.
const DEFAULT_LIMIT: i64 = 100;

/// Advisory lock key serializing claim passes so per-group counts are exact.
const DISPATCH_LOCK_KEY: &str = "conduit.tasks.dispatch";

/// Exponential delay applied to a retry successor's `starting_at`.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(DEFAULT_RETRY_BACKOFF_BASE_SECS),
            max: Duration::from_secs(DEFAULT_RETRY_BACKOFF_MAX_SECS),
        }
    }
}

impl RetryBackoff {
    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    fn delay_for(&self, retry_count: i32) -> Duration {
        retry_backoff(retry_count, self.base, self.max)
    }
}

/// Result of [`TaskRepo::report_result`].
#[derive(Debug)]
pub enum ReportOutcome {
    /// The outcome was recorded. `successor` is the retry created for a
    /// FAILED task that still had retries left.
    Recorded {
        task: Task,
        successor: Option<Task>,
    },
    /// The task was not STARTED (already terminal or never dispatched).
    InvalidState(Task),
    NotFound,
}

/// Result of [`TaskRepo::cancel`].
#[derive(Debug)]
pub enum CancelOutcome {
    /// Moved to CANCELLED. `was_started` tells the caller to abort the run.
    Cancelled { task: Task, was_started: bool },
    /// Already terminal; the cancel is a no-op.
    AlreadyTerminal(Task),
    NotFound,
}

/// One task moved to EXPIRED by [`TaskRepo::expire_stale`].
#[derive(Debug)]
pub struct ExpiredTask {
    pub task: Task,
    pub reason: ExpiryReason,
    pub successor: Option<Task>,
}

/// Provides persistence and state transitions for tasks.
pub struct TaskRepo;

impl TaskRepo {
    /// Insert a new task in CREATED.
    pub async fn create(pool: &PgPool, input: &CreateTask) -> Result<Task, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        Self::insert(&mut conn, input).await
    }

    /// Insert inside a caller-owned transaction or connection.
    pub(crate) async fn insert(
        conn: &mut PgConnection,
        input: &CreateTask,
    ) -> Result<Task, sqlx::Error> {
        let query = format!(
            "INSERT INTO tasks \
                 (name, group_key, group_max_concurrency, payload, status_id, retry_max, \
                  heartbeat_timeout_secs, created_to_started_timeout_secs, \
                  started_to_completed_timeout_secs, schedule_id, starting_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, COALESCE($11, NOW())) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Task>(&query)
            .bind(&input.name)
            .bind(&input.group_key)
            .bind(input.group_max_concurrency)
            .bind(&input.payload)
            .bind(TaskStatus::Created.id())
            .bind(input.retry_max.unwrap_or(DEFAULT_RETRY_MAX))
            .bind(input.heartbeat_timeout_secs)
            .bind(input.created_to_started_timeout_secs)
            .bind(input.started_to_completed_timeout_secs)
            .bind(input.schedule_id)
            .bind(input.starting_at)
            .fetch_one(&mut *conn)
            .await
    }

    /// Find a task by its internal ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Task>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM tasks WHERE id = $1");
        sqlx::query_as::<_, Task>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Search tasks, ordered by id. Absent filters match everything.
    pub async fn search(pool: &PgPool, params: &TaskSearch) -> Result<Vec<Task>, sqlx::Error> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let query = format!(
            "SELECT {COLUMNS} FROM tasks \
             WHERE ($1::BIGINT[] IS NULL OR id = ANY($1)) \
               AND ($2::TEXT IS NULL OR group_key = $2) \
               AND ($3::SMALLINT[] IS NULL OR status_id = ANY($3)) \
               AND ($4::BIGINT IS NULL OR schedule_id = $4) \
             ORDER BY id \
             LIMIT $5"
        );
        sqlx::query_as::<_, Task>(&query)
            .bind(params.ids.as_deref())
            .bind(params.group_key.as_deref())
            .bind(params.status_ids.as_deref())
            .bind(params.schedule_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Claim up to `limit` runnable tasks and move them to STARTED.
    ///
    /// A task is runnable when it is CREATED, `starting_at <= now`, and its
    /// group stays within `group_max_concurrency` after the claim (0 means
    /// unlimited). Within a group, claims follow `starting_at`, then
    /// `created_at` order. Rows locked by another transaction are skipped,
    /// and claim passes are serialized by a transaction-scoped advisory lock
    /// so two concurrent passes can never both fill the same group slot.
    pub async fn dispatch_ready(
        pool: &PgPool,
        now: Timestamp,
        limit: i64,
        fence: Option<&LeaderFence>,
    ) -> Result<Vec<Task>, FencedError> {
        let mut tx = pool.begin().await?;
        if let Some(fence) = fence {
            LeaderLockRepo::hold_fence(&mut tx, fence).await?;
        }

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(DISPATCH_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let query = format!(
            "WITH candidates AS ( \
                 SELECT id, group_key, group_max_concurrency, starting_at, created_at \
                 FROM tasks \
                 WHERE status_id = $1 AND starting_at <= $2 \
                 FOR UPDATE SKIP LOCKED \
             ), \
             running AS ( \
                 SELECT group_key, COUNT(*) AS started \
                 FROM tasks \
                 WHERE status_id = $3 \
                 GROUP BY group_key \
             ), \
             ranked AS ( \
                 SELECT c.id AS claimed_id, c.group_max_concurrency, \
                        c.starting_at AS ready_at, c.created_at AS enqueued_at, \
                        ROW_NUMBER() OVER ( \
                            PARTITION BY c.group_key \
                            ORDER BY c.starting_at, c.created_at, c.id \
                        ) AS group_rank, \
                        COALESCE(r.started, 0) AS group_started \
                 FROM candidates c \
                 LEFT JOIN running r ON r.group_key = c.group_key \
             ), \
             eligible AS ( \
                 SELECT claimed_id FROM ranked \
                 WHERE group_max_concurrency = 0 \
                    OR group_started + group_rank <= group_max_concurrency \
                 ORDER BY ready_at, enqueued_at, claimed_id \
                 LIMIT $4 \
             ) \
             UPDATE tasks \
             SET status_id = $3, started_at = $2, last_heartbeat_at = $2, \
                 last_state_transition_at = $2, updated_at = NOW() \
             WHERE id IN (SELECT claimed_id FROM eligible) AND status_id = $1 \
             RETURNING {COLUMNS}"
        );
        let mut claimed = sqlx::query_as::<_, Task>(&query)
            .bind(TaskStatus::Created.id())
            .bind(now)
            .bind(TaskStatus::Started.id())
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        claimed.sort_by(|a, b| {
            (a.starting_at, a.created_at, a.id).cmp(&(b.starting_at, b.created_at, b.id))
        });
        Ok(claimed)
    }

    /// Refresh `last_heartbeat_at` on a STARTED task.
    ///
    /// Returns `false` if the task does not exist or is not STARTED.
    pub async fn heartbeat(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET last_heartbeat_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $2",
        )
        .bind(id)
        .bind(TaskStatus::Started.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the executing node's result for a STARTED task.
    ///
    /// A FAILED task with `retry_count < retry_max` gets a successor in
    /// CREATED with `retry_count + 1` and a backed-off `starting_at`, in the
    /// same transaction. The failure itself stays recorded on the original.
    pub async fn report_result(
        pool: &PgPool,
        id: DbId,
        outcome: TaskOutcome,
        output: Option<&serde_json::Value>,
        backoff: &RetryBackoff,
    ) -> Result<ReportOutcome, sqlx::Error> {
        let target = match outcome {
            TaskOutcome::Succeeded => TaskStatus::Succeeded,
            TaskOutcome::Failed => TaskStatus::Failed,
        };

        let mut tx = pool.begin().await?;
        let Some(current) = Self::lock(&mut tx, id).await? else {
            return Ok(ReportOutcome::NotFound);
        };
        if !task_state_machine::can_transition(current.status_id, target.id()) {
            return Ok(ReportOutcome::InvalidState(current));
        }

        let task = Self::terminate(&mut tx, id, target, output, Utc::now()).await?;
        let successor = if target == TaskStatus::Failed {
            Self::create_successor(&mut tx, &task, backoff).await?
        } else {
            None
        };
        tx.commit().await?;

        if let Some(next) = &successor {
            tracing::info!(
                task_id = task.id,
                successor_id = next.id,
                retry_count = next.retry_count,
                starting_at = %next.starting_at,
                "Task failed, retry scheduled",
            );
        }
        Ok(ReportOutcome::Recorded { task, successor })
    }

    /// Move tasks that overstayed a window to EXPIRED.
    ///
    /// STARTED tasks whose last heartbeat is older than their heartbeat
    /// timeout (row override, else `heartbeat_timeout`) or whose run time
    /// exceeds `started_to_completed_timeout_secs` expire, as do CREATED
    /// tasks older than `created_to_started_timeout_secs`. Expiry frees the
    /// group slot and, like FAILED, creates a successor when retries remain.
    pub async fn expire_stale(
        pool: &PgPool,
        now: Timestamp,
        heartbeat_timeout: Duration,
        limit: i64,
        backoff: &RetryBackoff,
        fence: Option<&LeaderFence>,
    ) -> Result<Vec<ExpiredTask>, FencedError> {
        let default_secs = heartbeat_timeout.as_secs() as i64;

        let mut tx = pool.begin().await?;
        if let Some(fence) = fence {
            LeaderLockRepo::hold_fence(&mut tx, fence).await?;
        }

        let query = format!(
            "SELECT {COLUMNS} FROM tasks \
             WHERE (status_id = $1 AND ( \
                        COALESCE(last_heartbeat_at, started_at, last_state_transition_at) \
                            + COALESCE(heartbeat_timeout_secs, $3) * INTERVAL '1 second' < $4 \
                     OR (started_to_completed_timeout_secs IS NOT NULL \
                         AND COALESCE(started_at, last_state_transition_at) \
                             + started_to_completed_timeout_secs * INTERVAL '1 second' < $4))) \
                OR (status_id = $2 \
                    AND created_to_started_timeout_secs IS NOT NULL \
                    AND created_at + created_to_started_timeout_secs * INTERVAL '1 second' < $4) \
             ORDER BY id \
             LIMIT $5 \
             FOR UPDATE SKIP LOCKED"
        );
        let stale = sqlx::query_as::<_, Task>(&query)
            .bind(TaskStatus::Started.id())
            .bind(TaskStatus::Created.id())
            .bind(default_secs)
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        let mut expired = Vec::with_capacity(stale.len());
        for candidate in stale {
            let Some(reason) = candidate.expiry_reason(now, default_secs) else {
                continue;
            };
            let output = serde_json::json!({ "reason": reason.as_str() });
            let task =
                Self::terminate(&mut tx, candidate.id, TaskStatus::Expired, Some(&output), now)
                    .await?;
            let successor = Self::create_successor(&mut tx, &task, backoff).await?;
            expired.push(ExpiredTask {
                task,
                reason,
                successor,
            });
        }
        tx.commit().await?;
        Ok(expired)
    }

    /// Cancel a CREATED or STARTED task. Cancelling a terminal task is a no-op.
    pub async fn cancel(pool: &PgPool, id: DbId) -> Result<CancelOutcome, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let Some(current) = Self::lock(&mut tx, id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if task_state_machine::is_terminal(current.status_id) {
            return Ok(CancelOutcome::AlreadyTerminal(current));
        }

        let was_started = current.status_id == TaskStatus::Started.id();
        let task = Self::terminate(&mut tx, id, TaskStatus::Cancelled, None, Utc::now()).await?;
        tx.commit().await?;

        Ok(CancelOutcome::Cancelled { task, was_started })
    }

    /// STARTED tasks not yet routed to a node, oldest first.
    ///
    /// Takes no row locks: the list is a hint, and [`assign_node`](Self::assign_node)
    /// is the claim. Routers racing on the same task see one CAS win.
    pub async fn list_unrouted(pool: &PgPool, limit: i64) -> Result<Vec<Task>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM tasks \
             WHERE status_id = $1 AND node_id IS NULL \
             ORDER BY started_at, id \
             LIMIT $2"
        );
        sqlx::query_as::<_, Task>(&query)
            .bind(TaskStatus::Started.id())
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Number of STARTED tasks waiting for a node.
    pub async fn count_unrouted(pool: &PgPool) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status_id = $1 AND node_id IS NULL")
                .bind(TaskStatus::Started.id())
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    /// Bind a STARTED task to a node. Returns `false` if another router got
    /// there first or the task left STARTED.
    pub async fn assign_node(pool: &PgPool, id: DbId, node_id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET node_id = $2, last_heartbeat_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $3 AND node_id IS NULL",
        )
        .bind(id)
        .bind(node_id)
        .bind(TaskStatus::Started.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Undo [`assign_node`](Self::assign_node) so the router retries later.
    pub async fn unassign_node(pool: &PgPool, id: DbId, node_id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET node_id = NULL, updated_at = NOW() \
             WHERE id = $1 AND node_id = $2 AND status_id = $3",
        )
        .bind(id)
        .bind(node_id)
        .bind(TaskStatus::Started.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// STARTED tasks currently routed to `node_id`.
    pub async fn count_in_flight_on_node(pool: &PgPool, node_id: DbId) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE node_id = $1 AND status_id = $2")
                .bind(node_id)
                .bind(TaskStatus::Started.id())
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    /// STARTED and CREATED counts per group.
    pub async fn group_loads(pool: &PgPool) -> Result<Vec<GroupLoad>, sqlx::Error> {
        sqlx::query_as::<_, GroupLoad>(
            "SELECT group_key, \
                    COUNT(*) FILTER (WHERE status_id = $1) AS started, \
                    COUNT(*) FILTER (WHERE status_id = $2) AS created \
             FROM tasks \
             WHERE status_id IN ($1, $2) \
             GROUP BY group_key \
             ORDER BY group_key",
        )
        .bind(TaskStatus::Started.id())
        .bind(TaskStatus::Created.id())
        .fetch_all(pool)
        .await
    }

    /// Hard-delete terminal tasks that terminated before `older_than`.
    ///
    /// A task still referenced as a schedule's `last_scheduled_task_id` is
    /// kept so the overlap guard can read its state.
    pub async fn prune_terminated(
        pool: &PgPool,
        older_than: Timestamp,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE id IN ( \
                 SELECT t.id FROM tasks t \
                 WHERE t.status_id = ANY($1) \
                   AND t.terminated_at < $2 \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM schedules s WHERE s.last_scheduled_task_id = t.id \
                   ) \
                 ORDER BY t.id \
                 LIMIT $3 \
             )",
        )
        .bind(&TERMINAL_TASK_STATUSES[..])
        .bind(older_than)
        .bind(limit)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Transaction helpers
    // -----------------------------------------------------------------------

    async fn lock(conn: &mut PgConnection, id: DbId) -> Result<Option<Task>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, Task>(&query)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
    }

    async fn terminate(
        conn: &mut PgConnection,
        id: DbId,
        status: TaskStatus,
        output: Option<&serde_json::Value>,
        now: Timestamp,
    ) -> Result<Task, sqlx::Error> {
        let query = format!(
            "UPDATE tasks \
             SET status_id = $2, output = COALESCE($3, output), \
                 terminated_at = $4, last_state_transition_at = $4, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Task>(&query)
            .bind(id)
            .bind(status.id())
            .bind(output)
            .bind(now)
            .fetch_one(&mut *conn)
            .await
    }

    /// Create the retry successor for a FAILED or EXPIRED task, if it has
    /// retries left. A scheduled task hands its schedule pointer over to the
    /// successor so the schedule does not re-fire underneath the retry.
    async fn create_successor(
        conn: &mut PgConnection,
        failed: &Task,
        backoff: &RetryBackoff,
    ) -> Result<Option<Task>, sqlx::Error> {
        if failed.retry_count >= failed.retry_max {
            return Ok(None);
        }

        let delay = backoff.delay_for(failed.retry_count);
        let query = format!(
            "INSERT INTO tasks \
                 (name, group_key, group_max_concurrency, payload, status_id, \
                  retry_count, retry_max, heartbeat_timeout_secs, \
                  created_to_started_timeout_secs, started_to_completed_timeout_secs, \
                  schedule_id, retry_of_task_id, starting_at) \
             SELECT name, group_key, group_max_concurrency, payload, $2, \
                    retry_count + 1, retry_max, heartbeat_timeout_secs, \
                    created_to_started_timeout_secs, started_to_completed_timeout_secs, \
                    schedule_id, id, NOW() + ($3 * INTERVAL '1 millisecond') \
             FROM tasks WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let successor = sqlx::query_as::<_, Task>(&query)
            .bind(failed.id)
            .bind(TaskStatus::Created.id())
            .bind(delay.as_millis() as i64)
            .fetch_one(&mut *conn)
            .await?;

        if let Some(schedule_id) = failed.schedule_id {
            sqlx::query(
                "UPDATE schedules SET last_scheduled_task_id = $2, updated_at = NOW() \
                 WHERE id = $1 AND last_scheduled_task_id = $3",
            )
            .bind(schedule_id)
            .bind(successor.id)
            .bind(failed.id)
            .execute(&mut *conn)
            .await?;
        }

        Ok(Some(successor))
    }
}

