//! Background task router.
//!
//! Polls for STARTED tasks that have not been pushed to a node yet, picks a
//! node through the [`FleetManager`], claims the task for it with a
//! conditional update and invokes the runner. Transport failures are
//! retried with backoff; once retries are exhausted the task is reported
//! FAILED, which consumes one task-level retry. With no capacity the task
//! stays STARTED for a later pass, and `expire_stale` recycles it if it
//! never gets going.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::backoff::{retry_with_backoff, RetryPolicy};
use conduit_core::fleet::NodeCandidate;
use conduit_db::models::task::{Task, TaskOutcome};
use conduit_db::repositories::{NodeRepo, RetryBackoff, TaskRepo};
use conduit_fleet::runner::ExecutionContext;
use conduit_fleet::{FleetError, FleetManager};
use futures::future::join_all;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::engine::in_flight::InFlightRegistry;

/// Default polling interval for the router loop.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum tasks routed per pass.
const DEFAULT_BATCH_SIZE: i64 = 100;

/// How a single routing attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The runner accepted the task.
    Invoked,
    /// The runner refused; the task was released for another node.
    Refused,
    /// Invocation failed after retries; the task was reported FAILED.
    Failed,
    /// The task was cancelled while the invocation was in progress.
    Cancelled,
}

/// Routes STARTED tasks to RUNNING nodes.
pub struct TaskRouter {
    pool: PgPool,
    fleet: Arc<FleetManager>,
    in_flight: Arc<InFlightRegistry>,
    backoff: RetryBackoff,
    invoke_retry: RetryPolicy,
    poll_interval: Duration,
    batch_size: i64,
}

impl TaskRouter {
    pub fn new(
        pool: PgPool,
        fleet: Arc<FleetManager>,
        in_flight: Arc<InFlightRegistry>,
        backoff: RetryBackoff,
    ) -> Self {
        Self {
            pool,
            fleet,
            in_flight,
            backoff,
            invoke_retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_invoke_retry(mut self, policy: RetryPolicy) -> Self {
        self.invoke_retry = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the router loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Task router started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Task router shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.route_pending().await {
                        tracing::error!(error = %e, "Routing pass failed");
                    }
                }
            }
        }
    }

    /// One routing pass. Returns how many tasks were handed to a node.
    ///
    /// Nodes are picked and claimed one task at a time so each pick sees the
    /// previous claim's load; invocations then run concurrently.
    pub async fn route_pending(&self) -> Result<usize, FleetError> {
        let pending = TaskRepo::list_unrouted(&self.pool, self.batch_size).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut claimed = Vec::new();
        for task in pending {
            let node = match self.fleet.pick_node().await {
                Ok(node) => node,
                Err(FleetError::NoCapacity(reason)) => {
                    tracing::debug!(task_id = task.id, %reason, "No capacity, task stays queued");
                    break;
                }
                Err(e) => return Err(e),
            };

            if !TaskRepo::assign_node(&self.pool, task.id, node.node_id).await? {
                continue;
            }
            NodeRepo::record_dispatch(&self.pool, node.node_id).await?;
            claimed.push((task, node));
        }

        let outcomes = join_all(claimed.iter().map(|(task, node)| self.invoke(task, node))).await;
        let mut invoked = 0;
        for ((task, node), outcome) in claimed.iter().zip(outcomes) {
            match outcome {
                Ok(RouteOutcome::Invoked) => invoked += 1,
                Ok(other) => {
                    tracing::debug!(task_id = task.id, node_id = node.node_id, outcome = ?other, "Task not invoked");
                }
                Err(e) => {
                    tracing::error!(task_id = task.id, node_id = node.node_id, error = %e, "Routing task failed");
                }
            }
        }
        Ok(invoked)
    }

    async fn invoke(&self, task: &Task, node: &NodeCandidate) -> Result<RouteOutcome, FleetError> {
        let token = self.in_flight.register(task.id);
        let runner = self.fleet.runner_for(node.node_id, &node.url).await;
        let context = ExecutionContext {
            task_id: task.id,
            task_name: task.name.clone(),
            group_key: task.group_key.clone(),
            attempt: task.retry_count + 1,
            node_id: node.node_id,
        };
        let (code, code_params) = code_of(&task.payload);

        let call = retry_with_backoff(&self.invoke_retry, "invoke task", || {
            runner.invoke(task.id, &context, code, &code_params)
        });
        let result = tokio::select! {
            _ = token.cancelled() => return Ok(RouteOutcome::Cancelled),
            result = call => result,
        };
        // Past this point the runner owns the task; aborts go over its
        // cancel RPC instead of the token.
        self.in_flight.complete(task.id);

        match result {
            Ok(true) => {
                tracing::info!(
                    task_id = task.id,
                    node_id = node.node_id,
                    attempt = context.attempt,
                    "Task dispatched to node",
                );
                Ok(RouteOutcome::Invoked)
            }
            Ok(false) => {
                TaskRepo::unassign_node(&self.pool, task.id, node.node_id).await?;
                tracing::warn!(task_id = task.id, node_id = node.node_id, "Runner refused task");
                Ok(RouteOutcome::Refused)
            }
            Err(e) => {
                TaskRepo::unassign_node(&self.pool, task.id, node.node_id).await?;
                let output = json!({ "error": format!("invoke failed: {e}") });
                TaskRepo::report_result(
                    &self.pool,
                    task.id,
                    TaskOutcome::Failed,
                    Some(&output),
                    &self.backoff,
                )
                .await?;
                tracing::error!(
                    task_id = task.id,
                    node_id = node.node_id,
                    error = %e,
                    "Invoking runner failed after retries, task failed",
                );
                Ok(RouteOutcome::Failed)
            }
        }
    }
}

/// Split a task payload into the script source and its parameters.
///
/// `code` must be a string; parameters come from `codeParams` (or
/// `code_params`) and default to `null`.
fn code_of(payload: &Value) -> (&str, Value) {
    let code = payload.get("code").and_then(Value::as_str).unwrap_or_default();
    let params = payload
        .get("codeParams")
        .or_else(|| payload.get("code_params"))
        .cloned()
        .unwrap_or(Value::Null);
    (code, params)
}
