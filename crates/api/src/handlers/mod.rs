pub mod fleet;
pub mod schedules;
pub mod tasks;
