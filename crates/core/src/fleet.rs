//! Node lifecycle state machine and routing policy (least-loaded first).

use crate::types::DbId;

/// Node status IDs matching `node_statuses` seed data (1-based SMALLSERIAL).
pub mod node_state_machine {
    pub const PENDING: i16 = 1;
    pub const STARTING: i16 = 2;
    pub const RUNNING: i16 = 3;
    pub const OUTDATED: i16 = 4;
    pub const FINISHING: i16 = 5;
    pub const IDLE: i16 = 6;
    pub const TERMINATED: i16 = 7;
    pub const ERROR: i16 = 8;

    /// Returns the set of valid target status IDs reachable from `from_status`.
    ///
    /// ERROR is reachable from every non-terminal state and only leads to
    /// TERMINATED. TERMINATED is final.
    pub fn valid_transitions(from_status: i16) -> &'static [i16] {
        match from_status {
            PENDING => &[STARTING, ERROR],
            STARTING => &[RUNNING, ERROR],
            RUNNING => &[OUTDATED, IDLE, ERROR],
            OUTDATED => &[FINISHING, ERROR],
            FINISHING => &[IDLE, ERROR],
            IDLE => &[TERMINATED, ERROR],
            ERROR => &[TERMINATED],
            TERMINATED => &[],
            _ => &[],
        }
    }

    pub fn can_transition(from: i16, to: i16) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// States whose node still holds (or is about to hold) provider resources.
    pub fn is_live(status: i16) -> bool {
        matches!(
            status,
            PENDING | STARTING | RUNNING | OUTDATED | FINISHING | IDLE
        )
    }
}

/// A RUNNING node considered for dispatch, with its current load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCandidate {
    pub node_id: DbId,
    pub deployment_id: DbId,
    pub url: String,
    /// Number of STARTED tasks currently routed to this node.
    pub active_tasks: i64,
}

/// Pick the least-loaded candidate.
///
/// When at least one candidate belongs to `active_deployment_id`, only those
/// are eligible; otherwise RUNNING nodes of superseded deployments serve as
/// fallback until replacements come up. Eligible nodes already carrying
/// `max_tasks` tasks are full (`0` means no per-node limit). Ties go to the
/// lowest node id.
pub fn pick_least_loaded(
    candidates: &[NodeCandidate],
    active_deployment_id: DbId,
    max_tasks: i64,
) -> Option<&NodeCandidate> {
    let has_active = candidates
        .iter()
        .any(|c| c.deployment_id == active_deployment_id);

    candidates
        .iter()
        .filter(|c| !has_active || c.deployment_id == active_deployment_id)
        .filter(|c| max_tasks <= 0 || c.active_tasks < max_tasks)
        .min_by_key(|c| (c.active_tasks, c.node_id))
}
