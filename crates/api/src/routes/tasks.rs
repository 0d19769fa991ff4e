//! Route definitions for the `/tasks` resource.

use axum::routing::{get, post, put};
use axum::Router;

use crate::handlers::tasks;
use crate::state::AppState;

/// Routes mounted at `/tasks`.
///
/// ```text
/// GET    /                  -> search_tasks
/// POST   /                  -> enqueue_task
/// GET    /{id}              -> get_task
/// POST   /{id}/cancel       -> cancel_task
/// POST   /{id}/heartbeat    -> heartbeat
/// PUT    /{id}/output       -> report_output
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(tasks::search_tasks).post(tasks::enqueue_task))
        .route("/{id}", get(tasks::get_task))
        .route("/{id}/cancel", post(tasks::cancel_task))
        .route("/{id}/heartbeat", post(tasks::heartbeat))
        .route("/{id}/output", put(tasks::report_output))
}
