//! Execution-node fleet: provisioning, rollout, health, idling and routing.
//!
//! The [`supervisor::FleetSupervisor`] loop drives every node through its
//! lifecycle using a pluggable [`provider::NodeProvider`]. The
//! [`manager::FleetManager`] is the request-path facade used by the
//! orchestrator to roll out deployments, receive idle notifications and
//! pick a node for a task.

pub mod config;
pub mod error;
pub mod manager;
pub mod planner;
pub mod provider;
pub mod runner;
pub mod supervisor;

pub use config::FleetConfig;
pub use error::FleetError;
pub use manager::FleetManager;
pub use supervisor::FleetSupervisor;
