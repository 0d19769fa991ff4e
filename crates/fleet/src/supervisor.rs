//! Fleet supervisor loop.
//!
//! Runs on every orchestrator instance but only acts while holding the
//! `fleet_supervisor` lease. Each tick loads a snapshot, asks the
//! [`planner`](crate::planner) for actions and executes them concurrently.
//! Node rows are only changed through compare-and-set transitions, so an
//! overlapping tick or idle callback can never move a node twice.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use conduit_core::backoff::{retry_with_backoff, RetryPolicy};
use conduit_core::types::DbId;
use conduit_db::models::deployment::Deployment;
use conduit_db::models::node::{CreateNode, Node, NodeTransition};
use conduit_db::models::status::NodeStatus;
use conduit_db::repositories::{
    DeploymentRepo, LeaderLockRepo, NodeConfigOverrideRepo, NodeRepo, TaskRepo,
};
use futures::future::join_all;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::planner::{desired_node, plan, Action, DesiredNode, FleetSnapshot};
use crate::provider::{Health, NodeConfig, NodeHandle, NodeProvider};
use crate::runner::RunnerRegistry;

/// Lease key guarding the supervisor.
pub const LEASE_KEY: &str = "fleet_supervisor";

/// Summary of one supervision tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub planned: usize,
    pub failed: usize,
}

/// Drives every node of one fleet through its lifecycle.
pub struct FleetSupervisor {
    pool: PgPool,
    config: FleetConfig,
    provider: Arc<dyn NodeProvider>,
    runners: Arc<RunnerRegistry>,
    holder_id: String,
    retry: RetryPolicy,
}

/// Per-tick state shared by concurrently executing actions.
struct TickContext {
    nodes: HashMap<DbId, Node>,
    active: Option<Deployment>,
    desired: Option<DesiredNode>,
}

impl FleetSupervisor {
    pub fn new(
        pool: PgPool,
        config: FleetConfig,
        provider: Arc<dyn NodeProvider>,
        runners: Arc<RunnerRegistry>,
        holder_id: String,
    ) -> Self {
        Self {
            pool,
            config,
            provider,
            runners,
            holder_id,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the backoff used for provider and runner calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the supervision loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        let mut leading = false;
        tracing::info!(
            fleet_id = %self.config.fleet_id,
            provider = self.provider.name(),
            holder_id = %self.holder_id,
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "Fleet supervisor started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Fleet supervisor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    leading = self.tick(leading).await;
                }
            }
        }

        if leading {
            if let Err(e) = LeaderLockRepo::release(&self.pool, LEASE_KEY, &self.holder_id).await {
                tracing::warn!(error = %e, "Failed to release fleet supervisor lease");
            }
        }
    }

    /// Renew the lease and, when held, supervise once. Returns whether this
    /// instance holds the lease afterwards.
    async fn tick(&self, was_leading: bool) -> bool {
        let lease = LeaderLockRepo::try_acquire(
            &self.pool,
            LEASE_KEY,
            &self.holder_id,
            self.config.lease_ttl,
        )
        .await;

        let leading = match lease {
            Ok(lease) => lease.is_some(),
            Err(e) => {
                tracing::error!(error = %e, "Fleet supervisor lease renewal failed");
                false
            }
        };
        match (was_leading, leading) {
            (false, true) => tracing::info!(holder_id = %self.holder_id, "Fleet supervisor lease acquired"),
            (true, false) => tracing::warn!(holder_id = %self.holder_id, "Fleet supervisor lease lost"),
            _ => {}
        }

        if leading {
            if let Err(e) = self.tick_once().await {
                tracing::error!(error = %e, "Fleet supervision tick failed");
            }
        }
        leading
    }

    /// Load a snapshot, plan, and execute. Exposed for tests and tooling.
    pub async fn tick_once(&self) -> Result<TickReport, FleetError> {
        let fleet_id = &self.config.fleet_id;
        let nodes = NodeRepo::list_for_fleet(&self.pool, fleet_id).await?;
        let active = DeploymentRepo::find_active(&self.pool, fleet_id).await?;
        let config_override = NodeConfigOverrideRepo::find(&self.pool, fleet_id).await?;
        let in_flight: HashMap<DbId, i64> = NodeRepo::in_flight_counts(&self.pool, fleet_id)
            .await?
            .into_iter()
            .collect();
        let waiting_tasks = TaskRepo::count_unrouted(&self.pool).await?;

        let actions = plan(
            &FleetSnapshot {
                now: Utc::now(),
                nodes: &nodes,
                active_deployment: active.as_ref(),
                config_override: config_override.as_ref(),
                in_flight: &in_flight,
                waiting_tasks,
            },
            &self.config,
        );

        let desired = active
            .as_ref()
            .map(|d| desired_node(&self.config, d, config_override.as_ref()));
        let ctx = TickContext {
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            active,
            desired,
        };

        let results = join_all(actions.iter().map(|a| self.execute(a, &ctx))).await;
        let mut report = TickReport {
            planned: actions.len(),
            failed: 0,
        };
        for (action, result) in actions.iter().zip(results) {
            if let Err(e) = result {
                report.failed += 1;
                tracing::error!(?action, error = %e, "Fleet action failed");
            }
        }
        Ok(report)
    }

    async fn execute(&self, action: &Action, ctx: &TickContext) -> Result<(), FleetError> {
        match action {
            Action::Create { count } => self.create_nodes(*count, ctx).await,
            Action::Provision { node_id } => self.provision(self.node(ctx, *node_id)?).await,
            Action::CheckHealth { node_id } => self.check_health(self.node(ctx, *node_id)?).await,
            Action::Outdate { node_id } => {
                self.transition(*node_id, NodeStatus::Running, NodeStatus::Outdated, None)
                    .await
            }
            Action::Drain { node_id } => self.drain(self.node(ctx, *node_id)?).await,
            Action::Idle { node_id } => {
                self.transition(*node_id, NodeStatus::Running, NodeStatus::Idle, None)
                    .await
            }
            Action::Release { node_id } => {
                self.transition(*node_id, NodeStatus::Finishing, NodeStatus::Idle, None)
                    .await
            }
            Action::Terminate { node_id } => self.terminate(self.node(ctx, *node_id)?).await,
            Action::ForceTerminate { node_id } => {
                self.force_terminate(self.node(ctx, *node_id)?).await
            }
            Action::Fail { node_id, reason } => {
                let node = self.node(ctx, *node_id)?;
                self.fail(node, reason).await
            }
            Action::WarnFinishing { node_id } => {
                tracing::warn!(
                    node_id,
                    alert = "fleet_health",
                    "Node has been finishing longer than the drain timeout, releasing it",
                );
                Ok(())
            }
            Action::PruneTerminated => {
                let retention = chrono::TimeDelta::from_std(self.config.timeouts.terminated_retention)
                    .unwrap_or(chrono::TimeDelta::days(7));
                let removed = NodeRepo::remove_terminated(
                    &self.pool,
                    &self.config.fleet_id,
                    Utc::now() - retention,
                )
                .await?;
                if removed > 0 {
                    tracing::info!(removed, "Removed terminated nodes");
                }
                Ok(())
            }
        }
    }

    fn node<'a>(&self, ctx: &'a TickContext, node_id: DbId) -> Result<&'a Node, FleetError> {
        ctx.nodes.get(&node_id).ok_or(FleetError::NodeNotFound(node_id))
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    async fn create_nodes(&self, count: i64, ctx: &TickContext) -> Result<(), FleetError> {
        let (Some(deployment), Some(desired)) = (&ctx.active, &ctx.desired) else {
            return Ok(());
        };
        for _ in 0..count {
            let node = NodeRepo::create(&self.pool, &new_node(&self.config, deployment, desired))
                .await?;
            tracing::info!(node_id = node.id, deployment_id = deployment.id, "Node requested");
        }
        Ok(())
    }

    async fn provision(&self, node: &Node) -> Result<(), FleetError> {
        let config = NodeConfig {
            node_id: node.id,
            fleet_id: node.fleet_id.clone(),
            image: node.image.clone(),
            cpu_milli: node.cpu_milli,
            memory_mb: node.memory_mb,
            storage_mb: node.storage_mb,
            idle_timeout_secs: node.idle_timeout_secs,
        };
        let policy = RetryPolicy {
            max_attempts: self.config.provision_max_attempts,
            ..self.retry.clone()
        };

        match retry_with_backoff(&policy, "provision node", || self.provider.create(&config)).await {
            Ok(handle) => {
                let changes = NodeTransition {
                    url: Some(handle.url.clone()),
                    provider_handle: Some(handle.id.clone()),
                    error: None,
                };
                let moved = NodeRepo::transition(
                    &self.pool,
                    node.id,
                    NodeStatus::Pending,
                    NodeStatus::Starting,
                    &changes,
                )
                .await?;
                if moved.is_none() {
                    // The row moved on (timed out) while we were provisioning.
                    self.provider.destroy(&handle).await?;
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    node_id = node.id,
                    alert = "fleet_health",
                    attempts = policy.max_attempts,
                    error = %e,
                    "Node provisioning failed",
                );
                self.transition(
                    node.id,
                    NodeStatus::Pending,
                    NodeStatus::Error,
                    Some(format!("provisioning failed: {e}")),
                )
                .await
            }
        }
    }

    async fn check_health(&self, node: &Node) -> Result<(), FleetError> {
        let Some(handle) = handle_of(node) else {
            return self.fail(node, "node has no provider handle").await;
        };
        let status = NodeStatus::from_id(node.status_id);

        if status == Some(NodeStatus::Starting) {
            // Not being healthy yet is normal while booting; the starting
            // timeout bounds how long we wait.
            if self.provider.health_check(&handle).await == Health::Healthy {
                return self
                    .transition(node.id, NodeStatus::Starting, NodeStatus::Running, None)
                    .await;
            }
            return Ok(());
        }

        let (provider, handle) = (&self.provider, &handle);
        let checked = retry_with_backoff(&self.retry, "node health check", move || async move {
            match provider.health_check(handle).await {
                Health::Healthy => Ok(()),
                Health::Unhealthy(reason) => Err(reason),
            }
        })
        .await;
        if let Err(reason) = checked {
            tracing::error!(node_id = node.id, alert = "fleet_health", %reason, "Node failed health check");
            let from = status.unwrap_or(NodeStatus::Running);
            self.transition(node.id, from, NodeStatus::Error, Some(format!("unhealthy: {reason}")))
                .await?;
            self.runners.evict(node.id).await;
        }
        Ok(())
    }

    async fn drain(&self, node: &Node) -> Result<(), FleetError> {
        let Some(url) = node.url.as_deref() else {
            return self.fail(node, "outdated node has no url").await;
        };
        let runner = self.runners.client_for(node.id, url).await;
        let notified = retry_with_backoff(&self.retry, "notify when idle", || {
            runner.notify_when_idle(node.id)
        })
        .await;

        match notified {
            Ok(()) => {
                self.transition(node.id, NodeStatus::Outdated, NodeStatus::Finishing, None)
                    .await
            }
            Err(e) => {
                tracing::error!(node_id = node.id, alert = "fleet_health", error = %e, "Outdated node unreachable");
                self.transition(
                    node.id,
                    NodeStatus::Outdated,
                    NodeStatus::Error,
                    Some(format!("drain request failed: {e}")),
                )
                .await
            }
        }
    }

    /// Destroy an IDLE node. Teardown is not retried here; a failure leaves
    /// the node IDLE for the next tick until the idle state timeout fails it.
    async fn terminate(&self, node: &Node) -> Result<(), FleetError> {
        if let Some(handle) = handle_of(node) {
            self.provider.destroy(&handle).await?;
        }
        self.transition(node.id, NodeStatus::Idle, NodeStatus::Terminated, None)
            .await?;
        self.runners.evict(node.id).await;
        Ok(())
    }

    async fn force_terminate(&self, node: &Node) -> Result<(), FleetError> {
        if let Some(handle) = handle_of(node) {
            if let Err(e) = self.provider.destroy(&handle).await {
                tracing::error!(
                    node_id = node.id,
                    alert = "fleet_health",
                    error = %e,
                    "Teardown of failed node errored; marking terminated anyway",
                );
            }
        }
        self.transition(node.id, NodeStatus::Error, NodeStatus::Terminated, None)
            .await?;
        self.runners.evict(node.id).await;
        Ok(())
    }

    async fn fail(&self, node: &Node, reason: &str) -> Result<(), FleetError> {
        let Some(from) = NodeStatus::from_id(node.status_id) else {
            return Ok(());
        };
        tracing::error!(node_id = node.id, %from, alert = "fleet_health", reason, "Node failed");
        self.transition(node.id, from, NodeStatus::Error, Some(reason.to_string()))
            .await
    }

    async fn transition(
        &self,
        node_id: DbId,
        from: NodeStatus,
        to: NodeStatus,
        error: Option<String>,
    ) -> Result<(), FleetError> {
        let changes = NodeTransition {
            error,
            ..Default::default()
        };
        if NodeRepo::transition(&self.pool, node_id, from, to, &changes)
            .await?
            .is_none()
        {
            tracing::debug!(node_id, %from, %to, "Node transition skipped, state changed");
        }
        Ok(())
    }
}

fn handle_of(node: &Node) -> Option<NodeHandle> {
    Some(NodeHandle {
        id: node.provider_handle.clone()?,
        url: node.url.clone()?,
    })
}

/// Insert DTO for a node of the active deployment.
pub(crate) fn new_node(config: &FleetConfig, deployment: &Deployment, desired: &DesiredNode) -> CreateNode {
    CreateNode {
        fleet_id: config.fleet_id.clone(),
        deployment_id: deployment.id,
        image: desired.image.clone(),
        cpu_milli: desired.cpu_milli,
        memory_mb: desired.memory_mb,
        storage_mb: desired.storage_mb,
        idle_timeout_secs: desired.idle_timeout_secs,
    }
}
