//! Leader lease rows.

use serde::Serialize;
use sqlx::FromRow;
use conduit_core::types::{DbId, Timestamp};

/// A row from the `leader_locks` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LeaderLock {
    pub id: DbId,
    pub key: String,
    pub holder_id: String,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
