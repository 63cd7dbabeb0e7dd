//! Error types for the decision engine.
//!
//! Only persistence failures and configuration failures are allowed to abort
//! a run. Everything else in the decision chain is encoded as a reason code or
//! an order status and never surfaces here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// A state transition could not be written back; the in-memory state was
    /// left untouched.
    #[error("State transition '{transition}' not persisted: {source}")]
    StatePersistence {
        transition: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Another scan or exit cycle holds the state lock or the stored cycle lease.
    #[error("A cycle is already running")]
    CycleInProgress,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("{field} must be greater than zero, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{0} is required for live execution")]
    MissingSecret(&'static str),
}

/// Failures talking to the execution venue. Always mapped to `FAILED` or
/// `REJECTED` by the live adapter; never propagated out of a cycle.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Venue returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Venue response could not be decoded: {0}")]
    Decode(String),
}

impl VenueError {
    /// Client errors (4xx other than 429) are the venue refusing the order
    /// rather than the transport failing.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            VenueError::Status { status, .. } if (400..500).contains(status) && *status != 429
        )
    }
}
