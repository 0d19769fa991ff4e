//! Repository for the `schedules` table.

use std::time::Duration;

use sqlx::PgPool;
use conduit_core::frequency::next_execution_after;
use conduit_core::scheduling::{schedule_state_machine, DEFAULT_RETRY_MAX};
use conduit_core::types::{DbId, Timestamp};

use crate::models::schedule::{CreateSchedule, Schedule, ScheduleSearch, UpdateSchedule};
use crate::models::status::{ScheduleStatus, TaskStatus, TERMINAL_TASK_STATUSES};
use crate::models::task::{CreateTask, Task};
use crate::repositories::leader_lock_repo::{FencedError, LeaderFence, LeaderLockRepo};
use crate::repositories::task_repo::TaskRepo;

/// Column list for `schedules` queries.
const COLUMNS: &str = "\
    id, name, group_key, group_max_concurrency, status_id, frequency_ms, payload, \
    retry_max, heartbeat_timeout_secs, created_to_started_timeout_secs, \
    started_to_completed_timeout_secs, allow_overlap, starts_at, next_execution_at, \
    last_scheduled_task_id, deleted_at, created_at, updated_at";

/// Same columns qualified with the `s` alias for joined queries.
const S_COLUMNS: &str = "\
    s.id, s.name, s.group_key, s.group_max_concurrency, s.status_id, s.frequency_ms, s.payload, \
    s.retry_max, s.heartbeat_timeout_secs, s.created_to_started_timeout_secs, \
    s.started_to_completed_timeout_secs, s.allow_overlap, s.starts_at, s.next_execution_at, \
    s.last_scheduled_task_id, s.deleted_at, s.created_at, s.updated_at";

const MAX_LIMIT: i64 = 1000;
const DEFAULT_LIMIT: i64 = 100;

/// Outcome of a pause / resume / delete / trigger request.
#[derive(Debug)]
pub enum ScheduleChange {
    Applied(Schedule),
    /// The schedule is in a state the request does not apply to.
    Rejected(Schedule),
    NotFound,
}

/// A schedule that fired, with the task it produced.
#[derive(Debug)]
pub struct Promotion {
    pub schedule: Schedule,
    pub task: Task,
}

impl Schedule {
    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms.max(0) as u64)
    }

    fn to_task(&self, starting_at: Timestamp) -> CreateTask {
        CreateTask {
            name: self.name.clone(),
            group_key: self.group_key.clone(),
            group_max_concurrency: self.group_max_concurrency,
            payload: self.payload.clone(),
            starting_at: Some(starting_at),
            retry_max: Some(self.retry_max),
            heartbeat_timeout_secs: self.heartbeat_timeout_secs,
            created_to_started_timeout_secs: self.created_to_started_timeout_secs,
            started_to_completed_timeout_secs: self.started_to_completed_timeout_secs,
            schedule_id: Some(self.id),
        }
    }
}

/// Provides persistence for recurring schedules and their promotion.
pub struct ScheduleRepo;

impl ScheduleRepo {
    /// Create a schedule in STARTED. `frequency` is the parsed cadence.
    pub async fn create(
        pool: &PgPool,
        input: &CreateSchedule,
        frequency: Duration,
    ) -> Result<Schedule, sqlx::Error> {
        let query = format!(
            "INSERT INTO schedules \
                 (name, group_key, group_max_concurrency, status_id, frequency_ms, payload, \
                  retry_max, heartbeat_timeout_secs, created_to_started_timeout_secs, \
                  started_to_completed_timeout_secs, allow_overlap, starts_at, next_execution_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, \
                     COALESCE($12, NOW()), COALESCE($12, NOW())) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Schedule>(&query)
            .bind(&input.name)
            .bind(&input.group_key)
            .bind(input.group_max_concurrency)
            .bind(ScheduleStatus::Started.id())
            .bind(frequency.as_millis() as i64)
            .bind(&input.payload)
            .bind(input.retry_max.unwrap_or(DEFAULT_RETRY_MAX))
            .bind(input.heartbeat_timeout_secs)
            .bind(input.created_to_started_timeout_secs)
            .bind(input.started_to_completed_timeout_secs)
            .bind(input.allow_overlap)
            .bind(input.starts_at)
            .fetch_one(pool)
            .await
    }

    /// Find a schedule that has not been deleted.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Schedule>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM schedules WHERE id = $1 AND deleted_at IS NULL");
        sqlx::query_as::<_, Schedule>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Search live schedules by name and state, ordered by id.
    pub async fn search(
        pool: &PgPool,
        params: &ScheduleSearch,
    ) -> Result<Vec<Schedule>, sqlx::Error> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let query = format!(
            "SELECT {COLUMNS} FROM schedules \
             WHERE deleted_at IS NULL \
               AND ($1::TEXT[] IS NULL OR name = ANY($1)) \
               AND ($2::SMALLINT IS NULL OR status_id = $2) \
             ORDER BY id \
             LIMIT $3"
        );
        sqlx::query_as::<_, Schedule>(&query)
            .bind(params.names.as_deref())
            .bind(params.status_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Patch mutable fields. `frequency` is the parsed replacement cadence.
    ///
    /// A cadence change re-anchors `next_execution_at` on the last slot.
    pub async fn update(
        pool: &PgPool,
        id: DbId,
        input: &UpdateSchedule,
        frequency: Option<Duration>,
    ) -> Result<Option<Schedule>, sqlx::Error> {
        let query = format!(
            "UPDATE schedules SET \
                 frequency_ms = COALESCE($2, frequency_ms), \
                 next_execution_at = CASE WHEN $2::BIGINT IS NULL THEN next_execution_at \
                     ELSE next_execution_at - (frequency_ms * INTERVAL '1 millisecond') \
                                            + ($2 * INTERVAL '1 millisecond') END, \
                 payload = COALESCE($3, payload), \
                 group_max_concurrency = COALESCE($4, group_max_concurrency), \
                 retry_max = COALESCE($5, retry_max), \
                 allow_overlap = COALESCE($6, allow_overlap), \
                 updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Schedule>(&query)
            .bind(id)
            .bind(frequency.map(|f| f.as_millis() as i64))
            .bind(input.payload.as_ref())
            .bind(input.group_max_concurrency)
            .bind(input.retry_max)
            .bind(input.allow_overlap)
            .fetch_optional(pool)
            .await
    }

    /// Pause a STARTED schedule.
    pub async fn pause(pool: &PgPool, id: DbId) -> Result<ScheduleChange, sqlx::Error> {
        Self::transition(pool, id, ScheduleStatus::Paused).await
    }

    /// Resume a PAUSED schedule. Slots missed while paused are skipped at
    /// the next promotion.
    pub async fn resume(pool: &PgPool, id: DbId) -> Result<ScheduleChange, sqlx::Error> {
        Self::transition(pool, id, ScheduleStatus::Started).await
    }

    /// Soft-delete a schedule. Its tasks are left untouched.
    pub async fn delete(pool: &PgPool, id: DbId) -> Result<ScheduleChange, sqlx::Error> {
        Self::transition(pool, id, ScheduleStatus::Deleted).await
    }

    /// Make a STARTED schedule due now so the next cycle fires it. The
    /// overlap guard still applies.
    pub async fn trigger(pool: &PgPool, id: DbId) -> Result<ScheduleChange, sqlx::Error> {
        let query = format!(
            "UPDATE schedules SET next_execution_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $2 AND deleted_at IS NULL \
             RETURNING {COLUMNS}"
        );
        let updated = sqlx::query_as::<_, Schedule>(&query)
            .bind(id)
            .bind(ScheduleStatus::Started.id())
            .fetch_optional(pool)
            .await?;
        match updated {
            Some(s) => Ok(ScheduleChange::Applied(s)),
            None => Self::rejected_or_missing(pool, id).await,
        }
    }

    /// Fire every due schedule: create its task and advance its cadence.
    ///
    /// A schedule is due when it is STARTED, `next_execution_at <= now`, and
    /// (unless `allow_overlap`) its last scheduled task is terminal or gone.
    /// Rows are claimed with `SKIP LOCKED`; a schedule skipped by the guard
    /// keeps its `next_execution_at` and is retried on the next cycle.
    pub async fn promote_due(
        pool: &PgPool,
        now: Timestamp,
        limit: i64,
        fence: Option<&LeaderFence>,
    ) -> Result<Vec<Promotion>, FencedError> {
        let mut tx = pool.begin().await?;
        if let Some(fence) = fence {
            LeaderLockRepo::hold_fence(&mut tx, fence).await?;
        }

        let query = format!(
            "SELECT {S_COLUMNS} FROM schedules s \
             LEFT JOIN tasks t ON t.id = s.last_scheduled_task_id \
             WHERE s.status_id = $1 \
               AND s.deleted_at IS NULL \
               AND s.next_execution_at <= $2 \
               AND (s.allow_overlap OR t.id IS NULL OR t.status_id = ANY($3)) \
             ORDER BY s.next_execution_at, s.id \
             LIMIT $4 \
             FOR UPDATE OF s SKIP LOCKED"
        );
        let due = sqlx::query_as::<_, Schedule>(&query)
            .bind(ScheduleStatus::Started.id())
            .bind(now)
            .bind(&TERMINAL_TASK_STATUSES[..])
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        let mut promoted = Vec::with_capacity(due.len());
        for schedule in due {
            let task = TaskRepo::insert(&mut tx, &schedule.to_task(now)).await?;
            let next = next_execution_after(schedule.next_execution_at, schedule.frequency(), now);

            let query = format!(
                "UPDATE schedules \
                 SET last_scheduled_task_id = $2, next_execution_at = $3, updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING {COLUMNS}"
            );
            let schedule = sqlx::query_as::<_, Schedule>(&query)
                .bind(schedule.id)
                .bind(task.id)
                .bind(next)
                .fetch_one(&mut *tx)
                .await?;
            promoted.push(Promotion { schedule, task });
        }
        tx.commit().await?;
        Ok(promoted)
    }

    /// Whether the schedule's last task is still outstanding.
    pub async fn has_outstanding_task(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let (outstanding,): (bool,) = sqlx::query_as(
            "SELECT EXISTS ( \
                 SELECT 1 FROM schedules s \
                 JOIN tasks t ON t.id = s.last_scheduled_task_id \
                 WHERE s.id = $1 AND t.status_id IN ($2, $3) \
             )",
        )
        .bind(id)
        .bind(TaskStatus::Created.id())
        .bind(TaskStatus::Started.id())
        .fetch_one(pool)
        .await?;
        Ok(outstanding)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn transition(
        pool: &PgPool,
        id: DbId,
        target: ScheduleStatus,
    ) -> Result<ScheduleChange, sqlx::Error> {
        let from: Vec<i16> = ScheduleStatus::ALL
            .iter()
            .map(|s| s.id())
            .filter(|from| schedule_state_machine::can_transition(*from, target.id()))
            .collect();
        let query = format!(
            "UPDATE schedules \
             SET status_id = $2, \
                 deleted_at = CASE WHEN $2 = $3 THEN NOW() ELSE deleted_at END, \
                 updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL AND status_id = ANY($4) \
             RETURNING {COLUMNS}"
        );
        let updated = sqlx::query_as::<_, Schedule>(&query)
            .bind(id)
            .bind(target.id())
            .bind(ScheduleStatus::Deleted.id())
            .bind(&from)
            .fetch_optional(pool)
            .await?;
        match updated {
            Some(s) => Ok(ScheduleChange::Applied(s)),
            None => Self::rejected_or_missing(pool, id).await,
        }
    }

    async fn rejected_or_missing(pool: &PgPool, id: DbId) -> Result<ScheduleChange, sqlx::Error> {
        Ok(match Self::find_by_id(pool, id).await? {
            Some(s) => ScheduleChange::Rejected(s),
            None => ScheduleChange::NotFound,
        })
    }
}
