//! Handlers for the `/schedules` resource.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use conduit_core::error::CoreError;
use conduit_core::frequency::parse_frequency;
use conduit_core::scheduling::{
    validate_group_max_concurrency, validate_payload, validate_retry_max, validate_task_input,
    validate_timeout_secs,
};
use conduit_core::types::DbId;
use conduit_db::models::schedule::{CreateSchedule, Schedule, UpdateSchedule};
use conduit_db::repositories::{ScheduleChange, ScheduleRepo};

use crate::error::{AppError, AppResult};
use crate::query::ScheduleSearchParams;
use crate::response::DataResponse;
use crate::state::AppState;

fn not_found(id: DbId) -> AppError {
    AppError::Core(CoreError::NotFound {
        entity: "Schedule",
        id,
    })
}

/// Map a state change to the schedule, 409 or 404.
fn applied(change: ScheduleChange, id: DbId, action: &str) -> AppResult<Schedule> {
    match change {
        ScheduleChange::Applied(schedule) => {
            tracing::info!(schedule_id = id, action, "Schedule updated");
            Ok(schedule)
        }
        ScheduleChange::Rejected(schedule) => Err(AppError::Core(CoreError::Conflict(format!(
            "Cannot {action} schedule {id} in status_id {}",
            schedule.status_id
        )))),
        ScheduleChange::NotFound => Err(not_found(id)),
    }
}

// ---------------------------------------------------------------------------
// Create / read
// ---------------------------------------------------------------------------

/// POST /api/v1/schedules
///
/// Create a STARTED schedule. The first task is promoted at `starts_at`
/// (default now). Names are unique among live schedules.
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(mut input): Json<CreateSchedule>,
) -> AppResult<impl IntoResponse> {
    let frequency = parse_frequency(&input.frequency)?;
    let retry_max = input.retry_max.unwrap_or(state.task_defaults.retry_max);
    validate_task_input(
        &input.name,
        &input.group_key,
        input.group_max_concurrency,
        retry_max,
        &input.payload,
    )?;
    validate_timeout_secs("heartbeat_timeout_secs", input.heartbeat_timeout_secs)?;
    validate_timeout_secs(
        "created_to_started_timeout_secs",
        input.created_to_started_timeout_secs,
    )?;
    validate_timeout_secs(
        "started_to_completed_timeout_secs",
        input.started_to_completed_timeout_secs,
    )?;
    input.retry_max = Some(retry_max);

    let schedule = ScheduleRepo::create(&state.pool, &input, frequency).await?;
    tracing::info!(
        schedule_id = schedule.id,
        name = %schedule.name,
        frequency_ms = schedule.frequency_ms,
        "Schedule created",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: schedule })))
}

/// GET /api/v1/schedules
///
/// Filters: `names` (comma-separated), `status`, `limit`.
pub async fn search_schedules(
    State(state): State<AppState>,
    Query(params): Query<ScheduleSearchParams>,
) -> AppResult<impl IntoResponse> {
    let search = params.into_search()?;
    let schedules = ScheduleRepo::search(&state.pool, &search).await?;
    Ok(Json(DataResponse { data: schedules }))
}

/// GET /api/v1/schedules/{id}
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let schedule = ScheduleRepo::find_by_id(&state.pool, id)
        .await?
        .ok_or_else(|| not_found(id))?;
    Ok(Json(DataResponse { data: schedule }))
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// PUT /api/v1/schedules/{id}
///
/// Patch cadence, payload and task policy. Only provided fields change.
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<UpdateSchedule>,
) -> AppResult<impl IntoResponse> {
    let frequency = input.frequency.as_deref().map(parse_frequency).transpose()?;
    if let Some(payload) = &input.payload {
        validate_payload(payload)?;
    }
    if let Some(cap) = input.group_max_concurrency {
        validate_group_max_concurrency(cap)?;
    }
    if let Some(retry_max) = input.retry_max {
        validate_retry_max(retry_max)?;
    }

    let schedule = ScheduleRepo::update(&state.pool, id, &input, frequency)
        .await?
        .ok_or_else(|| not_found(id))?;
    tracing::info!(schedule_id = id, "Schedule patched");
    Ok(Json(DataResponse { data: schedule }))
}

/// POST /api/v1/schedules/{id}/pause
pub async fn pause_schedule(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let change = ScheduleRepo::pause(&state.pool, id).await?;
    Ok(Json(DataResponse {
        data: applied(change, id, "pause")?,
    }))
}

/// POST /api/v1/schedules/{id}/resume
pub async fn resume_schedule(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let change = ScheduleRepo::resume(&state.pool, id).await?;
    Ok(Json(DataResponse {
        data: applied(change, id, "resume")?,
    }))
}

/// POST /api/v1/schedules/{id}/trigger
///
/// Make the schedule due now. The overlap guard still applies, so a
/// trigger while the previous task is running fires once it finishes.
pub async fn trigger_schedule(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let change = ScheduleRepo::trigger(&state.pool, id).await?;
    Ok(Json(DataResponse {
        data: applied(change, id, "trigger")?,
    }))
}

/// DELETE /api/v1/schedules/{id}
///
/// Soft delete. Returns 204; tasks already created are left alone.
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let change = ScheduleRepo::delete(&state.pool, id).await?;
    applied(change, id, "delete")?;
    Ok(StatusCode::NO_CONTENT)
}
