//! Domain layer for the conduit task orchestrator.
//!
//! Pure types, state machines, validation rules and retry policies shared by
//! the persistence, scheduler, fleet and API crates. Has zero internal
//! dependencies so every other crate can build on it.

pub mod backoff;
pub mod error;
pub mod fleet;
pub mod frequency;
pub mod scheduling;
pub mod types;
