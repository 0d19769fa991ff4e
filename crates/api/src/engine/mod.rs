//! Task execution engine.
//!
//! The [`task_router::TaskRouter`] pushes STARTED tasks onto fleet nodes;
//! [`in_flight::InFlightRegistry`] holds the per-process abort handles of
//! invocations still in progress.

pub mod in_flight;
pub mod task_router;
