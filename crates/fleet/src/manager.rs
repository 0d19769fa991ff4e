//! Request-path facade over the fleet.
//!
//! The orchestrator API and the task router go through [`FleetManager`];
//! lifecycle work that talks to the provider stays in the supervisor.

use std::sync::Arc;

use conduit_core::fleet::{pick_least_loaded, NodeCandidate};
use conduit_core::types::DbId;
use conduit_db::models::deployment::{CreateDeployment, Deployment};
use conduit_db::models::node::{Node, NodeSearch, NodeTransition};
use conduit_db::models::node_config_override::{NodeConfigOverride, UpsertNodeConfigOverride};
use conduit_db::models::status::NodeStatus;
use conduit_db::repositories::{DeploymentRepo, NodeConfigOverrideRepo, NodeRepo, TaskRepo};
use serde::Serialize;
use sqlx::PgPool;

use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::planner::desired_node;
use crate::runner::{RunnerClient, RunnerRegistry};
use crate::supervisor::new_node;

/// Result of rolling out a new deployment.
#[derive(Debug, Clone, Serialize)]
pub struct Rollout {
    pub deployment: Deployment,
    pub superseded: Option<Deployment>,
    /// PENDING nodes created for the new deployment.
    pub nodes: Vec<Node>,
}

/// What an idle notification did to the node.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "node", rename_all = "snake_case")]
pub enum IdleAck {
    /// A FINISHING node had no work left and moved to IDLE.
    Drained(Node),
    /// A RUNNING node started (or continued) an idle period.
    IdleSince(Node),
    /// The node still has in-flight tasks; nothing changed.
    Busy(Node),
    /// The node is in a state where idleness does not matter.
    Ignored(Node),
}

/// Fleet operations used on the request path.
pub struct FleetManager {
    pool: PgPool,
    config: FleetConfig,
    runners: Arc<RunnerRegistry>,
}

impl FleetManager {
    pub fn new(pool: PgPool, config: FleetConfig, runners: Arc<RunnerRegistry>) -> Self {
        Self {
            pool,
            config,
            runners,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn runners(&self) -> &Arc<RunnerRegistry> {
        &self.runners
    }

    /// Activate a new deployment and request its first nodes.
    ///
    /// Nodes of the superseded deployment keep serving until the supervisor
    /// sees replacements RUNNING; only then are they outdated and drained.
    pub async fn rollout(&self, input: &CreateDeployment) -> Result<Rollout, FleetError> {
        let fleet_id = &self.config.fleet_id;
        let config_override = NodeConfigOverrideRepo::find(&self.pool, fleet_id).await?;

        // Activation and the first nodes commit together: a failed insert
        // leaves the previous deployment active.
        let mut tx = self.pool.begin().await?;
        let activation = DeploymentRepo::activate_in(&mut tx, fleet_id, input).await?;
        let desired = desired_node(&self.config, &activation.deployment, config_override.as_ref());

        let count = self.config.min_nodes.max(1);
        let mut nodes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let input = new_node(&self.config, &activation.deployment, &desired);
            nodes.push(NodeRepo::create_in(&mut tx, &input).await?);
        }
        tx.commit().await?;

        tracing::info!(
            fleet_id = %fleet_id,
            deployment_id = activation.deployment.id,
            commit_hash = %activation.deployment.commit_hash,
            superseded_id = activation.superseded.as_ref().map(|d| d.id),
            nodes = nodes.len(),
            "Deployment rolled out",
        );
        Ok(Rollout {
            deployment: activation.deployment,
            superseded: activation.superseded,
            nodes,
        })
    }

    /// Handle a runner's idle callback.
    ///
    /// A FINISHING node moves to IDLE only when no STARTED task is still
    /// routed to it. A RUNNING node gets its idle period stamped so the
    /// supervisor can idle it after `idle_timeout_secs`.
    pub async fn notify_idle(&self, node_id: DbId) -> Result<IdleAck, FleetError> {
        let node = NodeRepo::find_by_id(&self.pool, node_id)
            .await?
            .ok_or(FleetError::NodeNotFound(node_id))?;

        if TaskRepo::count_in_flight_on_node(&self.pool, node_id).await? > 0 {
            tracing::debug!(node_id, "Idle notification ignored, tasks still in flight");
            return Ok(IdleAck::Busy(node));
        }

        match NodeStatus::from_id(node.status_id) {
            Some(NodeStatus::Finishing) => {
                let moved = NodeRepo::transition(
                    &self.pool,
                    node_id,
                    NodeStatus::Finishing,
                    NodeStatus::Idle,
                    &NodeTransition::default(),
                )
                .await?;
                Ok(match moved {
                    Some(node) => IdleAck::Drained(node),
                    None => IdleAck::Ignored(node),
                })
            }
            Some(NodeStatus::Running) => {
                NodeRepo::mark_idle_since(&self.pool, node_id).await?;
                let node = NodeRepo::find_by_id(&self.pool, node_id)
                    .await?
                    .ok_or(FleetError::NodeNotFound(node_id))?;
                Ok(IdleAck::IdleSince(node))
            }
            _ => Ok(IdleAck::Ignored(node)),
        }
    }

    /// Choose the RUNNING node that should take the next task.
    ///
    /// Prefers nodes of the active deployment, least loaded first, and
    /// never exceeds `max_tasks_per_node`.
    pub async fn pick_node(&self) -> Result<NodeCandidate, FleetError> {
        let active = DeploymentRepo::find_active(&self.pool, &self.config.fleet_id)
            .await?
            .ok_or_else(|| FleetError::NoCapacity("no active deployment".into()))?;

        let candidates: Vec<NodeCandidate> =
            NodeRepo::running_loads(&self.pool, &self.config.fleet_id)
                .await?
                .into_iter()
                .map(|load| NodeCandidate {
                    node_id: load.node_id,
                    deployment_id: load.deployment_id,
                    url: load.url,
                    active_tasks: load.active_tasks,
                })
                .collect();

        pick_least_loaded(&candidates, active.id, self.config.max_tasks_per_node)
            .cloned()
            .ok_or_else(|| {
                FleetError::NoCapacity(format!(
                    "{} running node(s), all at capacity",
                    candidates.len()
                ))
            })
    }

    /// Runner client for a node, cached per process.
    pub async fn runner_for(&self, node_id: DbId, url: &str) -> Arc<dyn RunnerClient> {
        self.runners.client_for(node_id, url).await
    }

    pub async fn active_deployment(&self) -> Result<Option<Deployment>, FleetError> {
        Ok(DeploymentRepo::find_active(&self.pool, &self.config.fleet_id).await?)
    }

    pub async fn deployments(&self, limit: i64) -> Result<Vec<Deployment>, FleetError> {
        Ok(DeploymentRepo::list(&self.pool, &self.config.fleet_id, limit).await?)
    }

    pub async fn nodes(&self, search: &NodeSearch) -> Result<Vec<Node>, FleetError> {
        Ok(NodeRepo::search(&self.pool, &self.config.fleet_id, search).await?)
    }

    pub async fn node(&self, node_id: DbId) -> Result<Node, FleetError> {
        NodeRepo::find_by_id(&self.pool, node_id)
            .await?
            .filter(|n| n.fleet_id == self.config.fleet_id)
            .ok_or(FleetError::NodeNotFound(node_id))
    }

    pub async fn config_override(&self) -> Result<Option<NodeConfigOverride>, FleetError> {
        Ok(NodeConfigOverrideRepo::find(&self.pool, &self.config.fleet_id).await?)
    }

    /// Replace the fleet's node override. Existing nodes whose resources no
    /// longer match are replaced gradually by the supervisor.
    pub async fn set_config_override(
        &self,
        input: &UpsertNodeConfigOverride,
    ) -> Result<NodeConfigOverride, FleetError> {
        let saved = NodeConfigOverrideRepo::upsert(&self.pool, &self.config.fleet_id, input).await?;
        tracing::info!(fleet_id = %self.config.fleet_id, "Node config override updated");
        Ok(saved)
    }

    pub async fn clear_config_override(&self) -> Result<bool, FleetError> {
        Ok(NodeConfigOverrideRepo::delete(&self.pool, &self.config.fleet_id).await?)
    }
}
