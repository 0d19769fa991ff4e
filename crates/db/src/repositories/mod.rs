//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods
//! that accept `&PgPool` as the first argument.

pub mod deployment_repo;
pub mod leader_lock_repo;
pub mod node_config_override_repo;
pub mod node_repo;
pub mod schedule_repo;
pub mod task_repo;

pub use deployment_repo::{Activation, DeploymentRepo};
pub use leader_lock_repo::{FencedError, LeaderFence, LeaderLockRepo};
pub use node_config_override_repo::NodeConfigOverrideRepo;
pub use node_repo::NodeRepo;
pub use schedule_repo::{Promotion, ScheduleChange, ScheduleRepo};
pub use task_repo::{CancelOutcome, ExpiredTask, ReportOutcome, RetryBackoff, TaskRepo};
