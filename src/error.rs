//! Error types for canaria.
//!
//! This module provides a unified error type [`CanariaError`] for all canaria operations,
//! along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Validation**: rejected before any state is written (`InvalidWeight`, `UnknownRun`,
//!   `InvalidVersion`)
//! - **Lookup**: a referenced run or experiment is absent (`NotFound`)
//! - **Upstream**: the metadata store or serving backend failed or exceeded its deadline
//! - **Serving**: the active model set cannot be populated (`UnhealthyState`)
//! - **Configuration**: invalid settings or missing configuration
//!
//! # Example
//!
//! ```rust
//! use canaria::error::{CanariaError, Result};
//!
//! fn check_total(total: f64) -> Result<()> {
//!     if total <= 0.0 {
//!         return Err(CanariaError::InvalidWeight(format!("total weight is {}", total)));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_total(0.0).is_err());
//! ```

use crate::lifecycle::RebalanceReport;
use std::io;
use thiserror::Error;

/// Main error type for canaria operations.
#[derive(Error, Debug)]
pub enum CanariaError {
    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    // Validation errors
    #[error("Invalid weight: {0}")]
    InvalidWeight(String),

    #[error("Unknown runs referenced outside of the rebalance scope: {}", .0.join(", "))]
    UnknownRun(Vec<String>),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    // Upstream errors
    #[error("Upstream call timed out after {timeout_ms}ms: {operation}")]
    UpstreamTimeout { operation: String, timeout_ms: u64 },

    #[error("Metadata store error: {0}")]
    Store(String),

    #[error("Serving backend error: {0}")]
    Backend(String),

    #[error("Status of run {run_id} was committed but the serving backend call failed: {reason}")]
    DeploymentFailed { run_id: String, reason: String },

    #[error("Rebalance partially applied: {} succeeded, {} failed", .0.succeeded().len(), .0.failed().len())]
    PartialRebalance(Box<RebalanceReport>),

    // Serving errors
    #[error("Unhealthy state: {0}")]
    UnhealthyState(String),

    #[error("Prediction failed: {0}")]
    Prediction(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CanariaError {
    /// Check if error is retryable.
    ///
    /// A timed out write leaves the run status ambiguous; it is retryable only in the
    /// sense that every store and backend operation is idempotent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CanariaError::UpstreamTimeout { .. }
                | CanariaError::Network(_)
                | CanariaError::UnhealthyState(_)
                | CanariaError::DeploymentFailed { .. }
        )
    }

    /// Returns true if the error was raised by validation, before anything was written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CanariaError::InvalidWeight(_)
                | CanariaError::UnknownRun(_)
                | CanariaError::InvalidVersion(_)
        )
    }

    /// Convert to an HTTP status code.
    pub fn status_code(&self) -> u16 {
        match self {
            CanariaError::NotFound(_) => 404,
            CanariaError::InvalidWeight(_)
            | CanariaError::UnknownRun(_)
            | CanariaError::InvalidVersion(_) => 400,
            CanariaError::UpstreamTimeout { .. } => 504,
            CanariaError::Store(_)
            | CanariaError::Backend(_)
            | CanariaError::DeploymentFailed { .. }
            | CanariaError::PartialRebalance(_)
            | CanariaError::Network(_) => 502,
            CanariaError::UnhealthyState(_) => 503,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for CanariaError {
    fn from(e: serde_json::Error) -> Self {
        CanariaError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for CanariaError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            CanariaError::Serialization(e.to_string())
        } else {
            CanariaError::Network(e.to_string())
        }
    }
}

#[cfg(feature = "kube")]
impl From<kube::Error> for CanariaError {
    fn from(e: kube::Error) -> Self {
        CanariaError::Backend(e.to_string())
    }
}

/// Maps an HTTP client error, turning client-side timeouts into `UpstreamTimeout`.
pub(crate) fn http_error(e: reqwest::Error, operation: &str, timeout: std::time::Duration) -> CanariaError {
    if e.is_timeout() {
        CanariaError::UpstreamTimeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        CanariaError::from(e)
    }
}

/// Result type alias for canaria operations.
pub type Result<T> = std::result::Result<T, CanariaError>;
