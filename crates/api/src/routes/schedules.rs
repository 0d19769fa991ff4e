//! Route definitions for the `/schedules` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::schedules;
use crate::state::AppState;

/// Routes mounted at `/schedules`.
///
/// ```text
/// GET    /                  -> search_schedules
/// POST   /                  -> create_schedule
/// GET    /{id}              -> get_schedule
/// PUT    /{id}              -> update_schedule
/// DELETE /{id}              -> delete_schedule
/// POST   /{id}/pause        -> pause_schedule
/// POST   /{id}/resume       -> resume_schedule
/// POST   /{id}/trigger      -> trigger_schedule
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(schedules::search_schedules).post(schedules::create_schedule),
        )
        .route(
            "/{id}",
            get(schedules::get_schedule)
                .put(schedules::update_schedule)
                .delete(schedules::delete_schedule),
        )
        .route("/{id}/pause", post(schedules::pause_schedule))
        .route("/{id}/resume", post(schedules::resume_schedule))
        .route("/{id}/trigger", post(schedules::trigger_schedule))
}
