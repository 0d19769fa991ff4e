pub mod fleet;
pub mod health;
pub mod schedules;
pub mod tasks;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /tasks                                  search, enqueue
/// /tasks/{id}                             get
/// /tasks/{id}/cancel                      cancel (POST)
/// /tasks/{id}/heartbeat                   runner heartbeat (POST)
/// /tasks/{id}/output                      runner result (PUT)
///
/// /schedules                              search, create
/// /schedules/{id}                         get, update, delete
/// /schedules/{id}/pause                   pause (POST)
/// /schedules/{id}/resume                  resume (POST)
/// /schedules/{id}/trigger                 run now (POST)
///
/// /fleet/deployments                      list, rollout
/// /fleet/deployments/active               active deployment
/// /fleet/nodes                            list
/// /fleet/nodes/{id}                       get
/// /fleet/config-override                  get, replace, clear
/// ```
///
/// The runner idle callback (`/notifyWhenIdle`) and `/health` are mounted
/// at the root, outside this tree.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/tasks", tasks::router())
        .nest("/schedules", schedules::router())
        .nest("/fleet", fleet::router())
}
