use conduit_core::error::CoreError;
use conduit_core::types::DbId;

use crate::provider::ProviderError;

/// Error type for fleet operations.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// The node provider failed to create or destroy an instance.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A runner call failed at the transport level or returned non-2xx.
    #[error("Runner request failed: {0}")]
    Runner(String),

    /// No RUNNING node can take the task.
    #[error("No capacity: {0}")]
    NoCapacity(String),

    #[error("Node not found: {0}")]
    NodeNotFound(DbId),

    /// The supervisor lost its lease mid-tick.
    #[error("Fleet supervisor lease lost")]
    LeadershipLost,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<FleetError> for CoreError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::Provider(e) => CoreError::Provider(e.to_string()),
            FleetError::Runner(msg) => CoreError::Provider(msg),
            FleetError::NoCapacity(msg) => CoreError::NoCapacity(msg),
            FleetError::NodeNotFound(id) => CoreError::NotFound { entity: "Node", id },
            FleetError::LeadershipLost => CoreError::LeadershipLost,
            FleetError::Database(e) => CoreError::Internal(e.to_string()),
        }
    }
}
