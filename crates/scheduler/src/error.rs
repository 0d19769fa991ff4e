use conduit_core::error::CoreError;
use conduit_db::repositories::FencedError;

/// Error type for one scheduling cycle.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The lease was lost mid-cycle; the instance must demote itself.
    #[error("Leader lease {0} lost")]
    LeadershipLost(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<FencedError> for SchedulerError {
    fn from(err: FencedError) -> Self {
        match err {
            FencedError::LeadershipLost(key) => SchedulerError::LeadershipLost(key),
            FencedError::Database(e) => SchedulerError::Database(e),
        }
    }
}

impl From<SchedulerError> for CoreError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::LeadershipLost(_) => CoreError::LeadershipLost,
            SchedulerError::Database(e) => CoreError::Internal(e.to_string()),
        }
    }
}
