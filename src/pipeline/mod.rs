pub mod actor;
pub mod orchestrator;
pub mod schedule;
