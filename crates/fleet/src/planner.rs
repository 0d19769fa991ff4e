//! Pure supervision planning.
//!
//! [`plan`] looks at a snapshot of the fleet and decides what should happen
//! to each node on this tick. It performs no I/O, so the whole lifecycle
//! policy is unit-testable; [`FleetSupervisor`](crate::FleetSupervisor)
//! executes the returned actions.

use std::collections::HashMap;

use chrono::TimeDelta;
use conduit_core::types::{DbId, Timestamp};
use conduit_db::models::deployment::Deployment;
use conduit_db::models::node::Node;
use conduit_db::models::node_config_override::NodeConfigOverride;
use conduit_db::models::status::NodeStatus;

use crate::config::FleetConfig;

/// One step the supervisor should take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Insert `count` PENDING nodes for the active deployment.
    Create { count: i64 },
    /// Ask the provider for an instance (PENDING -> STARTING).
    Provision { node_id: DbId },
    /// Health-check a STARTING or RUNNING node.
    CheckHealth { node_id: DbId },
    /// Stop routing to a RUNNING node of an old deployment or config.
    Outdate { node_id: DbId },
    /// Tell an OUTDATED node to report when drained (-> FINISHING).
    Drain { node_id: DbId },
    /// Retire a RUNNING node that has been idle past its timeout.
    Idle { node_id: DbId },
    /// Retire a FINISHING node that has no work left or overstayed its
    /// drain timeout (-> IDLE).
    Release { node_id: DbId },
    /// Tear down an IDLE node (-> TERMINATED).
    Terminate { node_id: DbId },
    /// Tear down an ERROR node regardless of outcome (-> TERMINATED).
    ForceTerminate { node_id: DbId },
    /// Move a node that overstayed a state to ERROR.
    Fail { node_id: DbId, reason: String },
    /// A FINISHING node has been draining longer than allowed; paired with
    /// a [`Action::Release`].
    WarnFinishing { node_id: DbId },
    /// Delete TERMINATED rows older than the retention window.
    PruneTerminated,
}

/// Everything [`plan`] needs to know about the fleet.
pub struct FleetSnapshot<'a> {
    pub now: Timestamp,
    pub nodes: &'a [Node],
    pub active_deployment: Option<&'a Deployment>,
    pub config_override: Option<&'a NodeConfigOverride>,
    /// STARTED tasks per node id; absent means zero.
    pub in_flight: &'a HashMap<DbId, i64>,
    /// STARTED tasks not yet routed to any node.
    pub waiting_tasks: i64,
}

/// Resource settings a node is expected to run with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredNode {
    pub image: String,
    pub cpu_milli: i32,
    pub memory_mb: i32,
    pub storage_mb: i32,
    pub idle_timeout_secs: i32,
}

/// Resolve the node settings for the active deployment: per-fleet override
/// first, then the deployment image and configured defaults.
pub fn desired_node(
    config: &FleetConfig,
    deployment: &Deployment,
    config_override: Option<&NodeConfigOverride>,
) -> DesiredNode {
    let o = config_override;
    let d = &config.node_defaults;
    DesiredNode {
        image: o
            .and_then(|o| o.image.clone())
            .unwrap_or_else(|| deployment.image.clone()),
        cpu_milli: o.and_then(|o| o.cpu_milli).unwrap_or(d.cpu_milli),
        memory_mb: o.and_then(|o| o.memory_mb).unwrap_or(d.memory_mb),
        storage_mb: o.and_then(|o| o.storage_mb).unwrap_or(d.storage_mb),
        idle_timeout_secs: o
            .and_then(|o| o.idle_timeout_secs)
            .unwrap_or(d.idle_timeout_secs),
    }
}

/// Whether `node` runs the active deployment with the desired resources.
fn is_current(node: &Node, deployment: &Deployment, desired: &DesiredNode) -> bool {
    node.deployment_id == deployment.id
        && node.image == desired.image
        && node.cpu_milli == desired.cpu_milli
        && node.memory_mb == desired.memory_mb
        && node.storage_mb == desired.storage_mb
}

fn overstayed(node: &Node, now: Timestamp, limit: std::time::Duration) -> bool {
    now.signed_duration_since(node.last_state_transition_at)
        .to_std()
        .is_ok_and(|age| age > limit)
}

/// Start of the node's current quiet period.
fn quiet_since(node: &Node) -> Timestamp {
    node.idle_since.unwrap_or_else(|| {
        node.last_dispatched_at
            .map_or(node.last_state_transition_at, |d| d.max(node.last_state_transition_at))
    })
}

/// Decide this tick's actions.
pub fn plan(snapshot: &FleetSnapshot<'_>, config: &FleetConfig) -> Vec<Action> {
    let now = snapshot.now;
    let timeouts = &config.timeouts;
    let load = |id: DbId| snapshot.in_flight.get(&id).copied().unwrap_or(0);
    let desired = snapshot
        .active_deployment
        .map(|d| (d, desired_node(config, d, snapshot.config_override)));
    let current = |node: &Node| {
        desired
            .as_ref()
            .is_some_and(|(d, want)| is_current(node, d, want))
    };

    let running: Vec<&Node> = snapshot
        .nodes
        .iter()
        .filter(|n| n.status_id == NodeStatus::Running.id())
        .collect();
    let current_running = running.iter().filter(|&&n| current(n)).count() as i64;
    // Old RUNNING nodes are only drained once replacements carry the floor.
    let replacements_ready = current_running >= config.min_nodes.max(1);

    let mut actions = Vec::new();
    let mut running_after_idle = current_running;
    let mut prune = false;

    for node in snapshot.nodes {
        let node_id = node.id;
        let Some(status) = NodeStatus::from_id(node.status_id) else {
            continue;
        };

        match status {
            NodeStatus::Pending => {
                if overstayed(node, now, timeouts.pending) {
                    actions.push(Action::Fail {
                        node_id,
                        reason: "pending_timeout_exceeded".into(),
                    });
                } else {
                    actions.push(Action::Provision { node_id });
                }
            }
            NodeStatus::Starting => {
                if overstayed(node, now, timeouts.starting) {
                    actions.push(Action::Fail {
                        node_id,
                        reason: "starting_timeout_exceeded".into(),
                    });
                } else {
                    actions.push(Action::CheckHealth { node_id });
                }
            }
            NodeStatus::Running => {
                if !current(node) {
                    if replacements_ready {
                        actions.push(Action::Outdate { node_id });
                    } else {
                        actions.push(Action::CheckHealth { node_id });
                    }
                    continue;
                }

                let idle_for = now.signed_duration_since(quiet_since(node));
                let idle_limit = TimeDelta::seconds(node.idle_timeout_secs.into());
                if load(node_id) == 0
                    && idle_for > idle_limit
                    && running_after_idle > config.min_nodes
                {
                    running_after_idle -= 1;
                    actions.push(Action::Idle { node_id });
                } else {
                    actions.push(Action::CheckHealth { node_id });
                }
            }
            NodeStatus::Outdated => actions.push(Action::Drain { node_id }),
            NodeStatus::Finishing => {
                // The runner's idle callback usually gets here first; this
                // covers a callback that came back busy or never came.
                if overstayed(node, now, timeouts.finishing) {
                    actions.push(Action::WarnFinishing { node_id });
                    actions.push(Action::Release { node_id });
                } else if load(node_id) == 0 {
                    actions.push(Action::Release { node_id });
                }
            }
            NodeStatus::Idle => {
                if overstayed(node, now, timeouts.idle) {
                    actions.push(Action::Fail {
                        node_id,
                        reason: "idle_teardown_timeout_exceeded".into(),
                    });
                } else {
                    actions.push(Action::Terminate { node_id });
                }
            }
            NodeStatus::Error => actions.push(Action::ForceTerminate { node_id }),
            NodeStatus::Terminated => {
                prune |= overstayed(node, now, timeouts.terminated_retention);
            }
        }
    }

    if let Some(create) = scale(snapshot, config, &current, &load) {
        actions.push(create);
    }
    if prune {
        actions.push(Action::PruneTerminated);
    }
    actions
}

/// Nodes to add: top up to `min_nodes` of the active deployment, and add
/// one more when tasks are waiting and every current RUNNING node is full.
fn scale(
    snapshot: &FleetSnapshot<'_>,
    config: &FleetConfig,
    current: &dyn Fn(&Node) -> bool,
    load: &dyn Fn(DbId) -> i64,
) -> Option<Action> {
    snapshot.active_deployment?;

    let booting = |n: &&Node| {
        n.status_id == NodeStatus::Pending.id() || n.status_id == NodeStatus::Starting.id()
    };
    let live_total = snapshot
        .nodes
        .iter()
        .filter(|n| {
            NodeStatus::from_id(n.status_id).is_some_and(|s| {
                matches!(
                    s,
                    NodeStatus::Pending
                        | NodeStatus::Starting
                        | NodeStatus::Running
                        | NodeStatus::Outdated
                        | NodeStatus::Finishing
                )
            })
        })
        .count() as i64;
    let current_booting = snapshot
        .nodes
        .iter()
        .filter(booting)
        .filter(|&n| current(n))
        .count() as i64;
    let current_running: Vec<&Node> = snapshot
        .nodes
        .iter()
        .filter(|&n| n.status_id == NodeStatus::Running.id() && current(n))
        .collect();

    let headroom = (config.max_nodes - live_total).max(0);
    let floor_gap = config.min_nodes - current_booting - current_running.len() as i64;

    let mut wanted = floor_gap.max(0);
    if wanted == 0 && snapshot.waiting_tasks > 0 && current_booting == 0 {
        let all_full = config.max_tasks_per_node > 0
            && current_running
                .iter()
                .all(|n| load(n.id) >= config.max_tasks_per_node);
        if all_full {
            wanted = 1;
        }
    }

    let count = wanted.min(headroom);
    (count > 0).then_some(Action::Create { count })
}
