//! Shared data structures and utilities for the probe engine
//!
//! This crate contains the configuration model, the status/failure types
//! carried by every scheduled unit of work, and small utilities used by
//! the probe binary.

pub mod config;
pub mod defaults;
pub mod status;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::{parse_interval, EngineConfig, QueryConfig, QueryType, TestConfig, TestsConfig};
pub use status::{Failure, Outcome, Status};
pub use utils::fingerprint;

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the probe engine
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initialization error: {0}")]
    Init(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests;
