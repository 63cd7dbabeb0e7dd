//! Weather prediction-market decision engine.
//!
//! Forecasts and bucket quotes go in; gated, idempotent orders and a full
//! audit trail come out. See [`pipeline::DecisionPipeline`] for the scan
//! cycle.

pub mod config;
pub mod data;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod pipeline;
pub mod strategies;

pub use error::{EngineError, Result};
