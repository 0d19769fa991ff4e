//! Handlers for fleet administration and the runner idle callback.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use conduit_core::error::CoreError;
use conduit_core::types::DbId;
use conduit_db::models::deployment::CreateDeployment;
use conduit_db::models::node_config_override::UpsertNodeConfigOverride;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::query::{LimitParams, NodeSearchParams};
use crate::response::DataResponse;
use crate::state::AppState;

const DEFAULT_DEPLOYMENT_LIMIT: i64 = 20;
const MAX_DEPLOYMENT_LIMIT: i64 = 200;

// ---------------------------------------------------------------------------
// Deployments
// ---------------------------------------------------------------------------

/// POST /api/v1/fleet/deployments
///
/// Activate a new code version. Old nodes keep serving until the
/// replacements are RUNNING.
pub async fn create_deployment(
    State(state): State<AppState>,
    Json(input): Json<CreateDeployment>,
) -> AppResult<impl IntoResponse> {
    if input.commit_hash.trim().is_empty() {
        return Err(AppError::BadRequest("commit_hash must not be empty".into()));
    }
    if input.image.trim().is_empty() {
        return Err(AppError::BadRequest("image must not be empty".into()));
    }

    let rollout = state.fleet.rollout(&input).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: rollout })))
}

/// GET /api/v1/fleet/deployments
///
/// Most recent first. `limit` defaults to 20.
pub async fn list_deployments(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> AppResult<impl IntoResponse> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_DEPLOYMENT_LIMIT)
        .clamp(1, MAX_DEPLOYMENT_LIMIT);
    let deployments = state.fleet.deployments(limit).await?;
    Ok(Json(DataResponse { data: deployments }))
}

/// GET /api/v1/fleet/deployments/active
pub async fn get_active_deployment(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let deployment = state.fleet.active_deployment().await?.ok_or_else(|| {
        AppError::Core(CoreError::NotFound {
            entity: "Deployment",
            id: 0,
        })
    })?;
    Ok(Json(DataResponse { data: deployment }))
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// GET /api/v1/fleet/nodes
///
/// Filters: `status` (comma-separated node states), `deployment_id`.
pub async fn list_nodes(
    State(state): State<AppState>,
    Query(params): Query<NodeSearchParams>,
) -> AppResult<impl IntoResponse> {
    let search = params.into_search()?;
    let nodes = state.fleet.nodes(&search).await?;
    Ok(Json(DataResponse { data: nodes }))
}

/// GET /api/v1/fleet/nodes/{id}
pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let node = state.fleet.node(id).await?;
    Ok(Json(DataResponse { data: node }))
}

// ---------------------------------------------------------------------------
// Node config override
// ---------------------------------------------------------------------------

/// GET /api/v1/fleet/config-override
pub async fn get_config_override(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let config_override = state.fleet.config_override().await?;
    Ok(Json(DataResponse {
        data: config_override,
    }))
}

/// PUT /api/v1/fleet/config-override
///
/// Replaces the whole override; omitted fields fall back to the fleet
/// defaults.
pub async fn put_config_override(
    State(state): State<AppState>,
    Json(input): Json<UpsertNodeConfigOverride>,
) -> AppResult<impl IntoResponse> {
    let positive = [
        ("cpu_milli", input.cpu_milli),
        ("memory_mb", input.memory_mb),
        ("storage_mb", input.storage_mb),
        ("idle_timeout_secs", input.idle_timeout_secs),
    ];
    for (field, value) in positive {
        if value.is_some_and(|v| v <= 0) {
            return Err(AppError::BadRequest(format!("{field} must be positive")));
        }
    }
    if input.image.as_deref().is_some_and(|i| i.trim().is_empty()) {
        return Err(AppError::BadRequest("image must not be empty".into()));
    }

    let saved = state.fleet.set_config_override(&input).await?;
    Ok(Json(DataResponse { data: saved }))
}

/// DELETE /api/v1/fleet/config-override
pub async fn delete_config_override(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    if state.fleet.clear_config_override().await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::Core(CoreError::NotFound {
            entity: "NodeConfigOverride",
            id: 0,
        }))
    }
}

// ---------------------------------------------------------------------------
// Idle callback
// ---------------------------------------------------------------------------

/// Body of the runner's idle callback.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleNotification {
    pub node_id: DbId,
}

/// POST /notifyWhenIdle
///
/// Sent by a runner once it has no active work. Answers with what the
/// notification did to the node.
pub async fn notify_when_idle(
    State(state): State<AppState>,
    Json(body): Json<IdleNotification>,
) -> AppResult<impl IntoResponse> {
    let ack = state.fleet.notify_idle(body.node_id).await?;
    Ok(Json(DataResponse { data: ack }))
}
