pub mod context;
pub mod handler;
pub mod orchestrator;
pub mod types;
pub mod validate;
