//! Deployment entity models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use conduit_core::types::{DbId, Timestamp};

/// A row from the `deployments` table. Immutable once created apart from
/// `superseded_at`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Deployment {
    pub id: DbId,
    pub fleet_id: String,
    pub commit_hash: String,
    pub image: String,
    pub superseded_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Deployment {
    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }
}

/// DTO for `POST /api/v1/fleet/deployments`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateDeployment {
    pub commit_hash: String,
    pub image: String,
}
