//! Handlers for the `/tasks` resource.
//!
//! Enqueue, search and cancel serve other services; heartbeat and output
//! are called back by the executing node.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use conduit_core::backoff::{retry_with_backoff, RetryPolicy};
use conduit_core::error::CoreError;
use conduit_core::scheduling::{validate_task_input, validate_timeout_secs};
use conduit_core::types::DbId;
use conduit_db::models::task::{CreateTask, Task, TaskOutcome};
use conduit_db::repositories::{CancelOutcome, NodeRepo, ReportOutcome, TaskRepo};
use conduit_fleet::runner::ExecutionContext;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::query::TaskSearchParams;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn find_task(state: &AppState, id: DbId) -> AppResult<Task> {
    TaskRepo::find_by_id(&state.pool, id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound { entity: "Task", id }))
}

/// Validate an ad-hoc task and fill in the configured retry default.
pub(crate) fn prepare_task(
    mut input: CreateTask,
    default_retry_max: i32,
) -> Result<CreateTask, CoreError> {
    let retry_max = input.retry_max.unwrap_or(default_retry_max);
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
    input.schedule_id = None;
    Ok(input)
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// POST /api/v1/tasks
///
/// Enqueue an ad-hoc task in CREATED. Returns 201 with the task; the
/// scheduler starts it once it is due and its group has a free slot.
pub async fn enqueue_task(
    State(state): State<AppState>,
    Json(input): Json<CreateTask>,
) -> AppResult<impl IntoResponse> {
    let input = prepare_task(input, state.task_defaults.retry_max)?;
    let task = TaskRepo::create(&state.pool, &input).await?;

    tracing::info!(
        task_id = task.id,
        name = %task.name,
        group_key = %task.group_key,
        "Task enqueued",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: task })))
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// GET /api/v1/tasks
///
/// Filters: `ids`, `group_key`, `status` (comma-separated names),
/// `schedule_id`, `limit`.
pub async fn search_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskSearchParams>,
) -> AppResult<impl IntoResponse> {
    let search = params.into_search()?;
    let tasks = TaskRepo::search(&state.pool, &search).await?;
    Ok(Json(DataResponse { data: tasks }))
}

/// GET /api/v1/tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let task = find_task(&state, id).await?;
    Ok(Json(DataResponse { data: task }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/tasks/{id}/cancel
///
/// Cancel a CREATED or STARTED task. A STARTED task's node is asked to
/// abort in the background. Cancelling a terminal task is a no-op that
/// returns the task unchanged.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let task = match TaskRepo::cancel(&state.pool, id).await? {
        CancelOutcome::Cancelled { task, was_started } => {
            tracing::info!(task_id = id, was_started, "Task cancelled");
            state.in_flight.cancel(id);
            // The cancel is committed; failing to reach the node only means
            // its late result is ignored.
            if was_started {
                if let Err(e) = abort_on_node(&state, &task).await {
                    tracing::warn!(task_id = id, error = %e, "Could not request abort on node");
                }
            }
            task
        }
        CancelOutcome::AlreadyTerminal(task) => {
            tracing::debug!(task_id = id, status_id = task.status_id, "Cancel on terminal task ignored");
            task
        }
        CancelOutcome::NotFound => {
            return Err(AppError::Core(CoreError::NotFound { entity: "Task", id }));
        }
    };

    Ok(Json(DataResponse { data: task }))
}

/// Ask the node a cancelled task was routed to to abort it. The node lookup
/// runs inline, the abort request in the background.
async fn abort_on_node(state: &AppState, task: &Task) -> AppResult<()> {
    let Some(node_id) = task.node_id else {
        return Ok(());
    };
    let Some(url) = NodeRepo::find_by_id(&state.pool, node_id)
        .await?
        .and_then(|node| node.url)
    else {
        return Ok(());
    };

    let runner = state.fleet.runner_for(node_id, &url).await;
    let context = ExecutionContext {
        task_id: task.id,
        task_name: task.name.clone(),
        group_key: task.group_key.clone(),
        attempt: task.retry_count + 1,
        node_id,
    };
    let task_id = task.id;
    tokio::spawn(async move {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        match retry_with_backoff(&policy, "abort task", || runner.cancel(task_id, &context)).await {
            Ok(true) => tracing::info!(task_id, node_id, "Node aborted task"),
            Ok(false) => tracing::debug!(task_id, node_id, "Node was not running task"),
            Err(e) => tracing::warn!(task_id, node_id, error = %e, "Abort request failed"),
        }
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Node callbacks
// ---------------------------------------------------------------------------

/// POST /api/v1/tasks/{id}/heartbeat
///
/// Returns 204, or 409 if the task is no longer STARTED so the node can
/// stop working on it.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    if TaskRepo::heartbeat(&state.pool, id).await? {
        return Ok(StatusCode::NO_CONTENT);
    }

    let task = find_task(&state, id).await?;
    Err(AppError::Core(CoreError::Conflict(format!(
        "Task {} is not started (status_id {})",
        task.id, task.status_id
    ))))
}

/// Body of `PUT /api/v1/tasks/{id}/output`.
#[derive(Debug, Deserialize)]
pub struct ReportOutput {
    pub state: TaskOutcome,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    /// `false` when the task was no longer STARTED and nothing changed.
    pub recorded: bool,
    pub task: Task,
    pub successor: Option<Task>,
}

/// PUT /api/v1/tasks/{id}/output
///
/// Record a STARTED task's result. A late result for a task that already
/// reached a terminal state (cancelled, expired) is accepted and ignored.
pub async fn report_output(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    Json(input): Json<ReportOutput>,
) -> AppResult<impl IntoResponse> {
    if let Some(output) = &input.output {
        conduit_core::scheduling::validate_payload(output)?;
    }

    let outcome = TaskRepo::report_result(
        &state.pool,
        id,
        input.state,
        input.output.as_ref(),
        &state.task_defaults.retry_backoff,
    )
    .await?;

    let response = match outcome {
        ReportOutcome::Recorded { task, successor } => {
            state.in_flight.complete(id);
            tracing::info!(task_id = id, outcome = ?input.state, "Task result recorded");
            ReportResponse {
                recorded: true,
                task,
                successor,
            }
        }
        ReportOutcome::InvalidState(task) => {
            state.in_flight.complete(id);
            tracing::debug!(task_id = id, status_id = task.status_id, "Late task result ignored");
            ReportResponse {
                recorded: false,
                task,
                successor: None,
            }
        }
        ReportOutcome::NotFound => {
            return Err(AppError::Core(CoreError::NotFound { entity: "Task", id }));
        }
    };

    Ok(Json(DataResponse { data: response }))
}
