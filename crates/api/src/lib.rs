//! Conduit orchestrator library.
//!
//! Exposes config, state, error handling, routes and the background task
//! router so integration tests and the `conduit-orchestrator` binary share
//! the same building blocks.

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod query;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
