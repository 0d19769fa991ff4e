//! Domain model structs and DTOs.
//!
//! Each submodule contains:
//! - A `FromRow` + `Serialize` entity struct matching the database row
//! - A `Deserialize` create DTO for inserts
//! - Update / search DTOs where the entity supports them

pub mod deployment;
pub mod leader_lock;
pub mod node;
pub mod node_config_override;
pub mod schedule;
pub mod status;
pub mod task;
