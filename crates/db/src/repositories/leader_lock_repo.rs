//! Repository for the `leader_locks` table.
//!
//! A lease is one row per key. Acquisition is a single upsert that only
//! overwrites the row when the caller already holds it or the current
//! holder let it expire, so at most one unexpired holder exists per key.

use std::time::Duration;

use sqlx::{PgConnection, PgPool};

use crate::models::leader_lock::LeaderLock;

/// Column list for `leader_locks` queries.
const COLUMNS: &str = "id, key, holder_id, acquired_at, expires_at, created_at, updated_at";

/// Identity a leader presents when fencing a mutating transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderFence {
    pub key: String,
    pub holder_id: String,
}

/// Returned by fenced repository calls.
#[derive(Debug, thiserror::Error)]
pub enum FencedError {
    /// The lease was lost or taken over before the statement ran.
    #[error("leader lease {0} is no longer held")]
    LeadershipLost(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Lease acquisition, renewal and release.
pub struct LeaderLockRepo;

impl LeaderLockRepo {
    /// Acquire or renew the lease for `key`.
    ///
    /// Returns the row when `holder_id` holds the lease afterwards, `None`
    /// when another holder's lease is still valid. Renewal keeps the
    /// original `acquired_at`.
    pub async fn try_acquire(
        pool: &PgPool,
        key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<LeaderLock>, sqlx::Error> {
        let query = format!(
            "INSERT INTO leader_locks (key, holder_id, acquired_at, expires_at) \
             VALUES ($1, $2, NOW(), NOW() + ($3 * INTERVAL '1 millisecond')) \
             ON CONFLICT (key) DO UPDATE \
             SET holder_id = EXCLUDED.holder_id, \
                 acquired_at = CASE WHEN leader_locks.holder_id = EXCLUDED.holder_id \
                                    THEN leader_locks.acquired_at ELSE NOW() END, \
                 expires_at = EXCLUDED.expires_at, \
                 updated_at = NOW() \
             WHERE leader_locks.holder_id = EXCLUDED.holder_id \
                OR leader_locks.expires_at < NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, LeaderLock>(&query)
            .bind(key)
            .bind(holder_id)
            .bind(ttl.as_millis() as i64)
            .fetch_optional(pool)
            .await
    }

    /// Give the lease up immediately. Returns `false` if it was not held.
    pub async fn release(pool: &PgPool, key: &str, holder_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM leader_locks WHERE key = $1 AND holder_id = $2")
            .bind(key)
            .bind(holder_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Current lease row for `key`, expired or not.
    pub async fn find(pool: &PgPool, key: &str) -> Result<Option<LeaderLock>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM leader_locks WHERE key = $1");
        sqlx::query_as::<_, LeaderLock>(&query)
            .bind(key)
            .fetch_optional(pool)
            .await
    }

    /// Verify the fence inside an open transaction.
    ///
    /// The row is locked `FOR SHARE`, so a competing `try_acquire` blocks
    /// until the caller's transaction ends. Every leader-only write runs
    /// after this check in the same transaction.
    pub async fn hold_fence(
        conn: &mut PgConnection,
        fence: &LeaderFence,
    ) -> Result<(), FencedError> {
        let held: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM leader_locks \
             WHERE key = $1 AND holder_id = $2 AND expires_at > NOW() \
             FOR SHARE",
        )
        .bind(&fence.key)
        .bind(&fence.holder_id)
        .fetch_optional(&mut *conn)
        .await?;

        match held {
            Some(_) => Ok(()),
            None => Err(FencedError::LeadershipLost(fence.key.clone())),
        }
    }
}
