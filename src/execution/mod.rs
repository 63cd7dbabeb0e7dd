pub mod executor;
pub mod idempotency;
pub mod live;
pub mod persistence;
pub mod risk;
pub mod simulator;
pub mod state;
pub mod types;
