//! Leader-elected scheduling loop.
//!
//! Exactly one instance per lease key holds the [`leader::LeaderElector`]
//! lease at a time; only that instance promotes schedules, dispatches
//! ready tasks and expires stale ones. Every mutating cycle step is fenced
//! on the lease, so an instance that lost it cannot write.

pub mod config;
pub mod error;
pub mod leader;
pub mod scheduler;

pub use config::{SchedulerConfig, TaskDefaults};
pub use error::SchedulerError;
pub use leader::{LeaderElector, LeaderState};
pub use scheduler::{CycleReport, Scheduler};
