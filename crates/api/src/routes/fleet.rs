//! Route definitions for fleet administration and the runner callback.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::fleet;
use crate::state::AppState;

/// Routes mounted at `/fleet`.
///
/// ```text
/// GET    /deployments           -> list_deployments
/// POST   /deployments           -> create_deployment
/// GET    /deployments/active    -> get_active_deployment
/// GET    /nodes                 -> list_nodes
/// GET    /nodes/{id}            -> get_node
/// GET    /config-override       -> get_config_override
/// PUT    /config-override       -> put_config_override
/// DELETE /config-override       -> delete_config_override
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/deployments",
            get(fleet::list_deployments).post(fleet::create_deployment),
        )
        .route("/deployments/active", get(fleet::get_active_deployment))
        .route("/nodes", get(fleet::list_nodes))
        .route("/nodes/{id}", get(fleet::get_node))
        .route(
            "/config-override",
            get(fleet::get_config_override)
                .put(fleet::put_config_override)
                .delete(fleet::delete_config_override),
        )
}

/// Runner callbacks mounted at the root, outside `/api/v1`.
///
/// ```text
/// POST   /notifyWhenIdle        -> notify_when_idle
/// ```
pub fn callback_router() -> Router<AppState> {
    Router::new().route("/notifyWhenIdle", post(fleet::notify_when_idle))
}
