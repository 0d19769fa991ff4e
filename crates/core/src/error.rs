use crate::types::DbId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// A state transition was attempted from an incompatible state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No RUNNING node is available to accept work.
    #[error("No capacity: {0}")]
    NoCapacity(String),

    /// Node provisioning or teardown failed at the infrastructure provider.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A heartbeat, health check or remote call lapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The current process no longer holds the leader lease.
    #[error("Leadership lost")]
    LeadershipLost,

    #[error("Internal error: {0}")]
    Internal(String),
}
