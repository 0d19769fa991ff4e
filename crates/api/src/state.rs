use std::sync::Arc;

use conduit_fleet::FleetManager;
use conduit_scheduler::TaskDefaults;

use crate::config::ServerConfig;
use crate::engine::in_flight::InFlightRegistry;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: conduit_db::DbPool,
    pub config: Arc<ServerConfig>,
    /// Retry defaults applied to enqueued tasks and reported failures.
    pub task_defaults: Arc<TaskDefaults>,
    /// Request-path access to the node fleet.
    pub fleet: Arc<FleetManager>,
    /// Cancellation handles of tasks this process pushed to a node.
    pub in_flight: Arc<InFlightRegistry>,
}
