//! Token lifecycle: per-token state machines and their owning manager

pub mod manager;
pub mod state_machine;

pub use manager::CategoryManager;
pub use state_machine::{CategoryEvent, TokenStateMachine, Transition};
