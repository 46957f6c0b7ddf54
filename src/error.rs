//! Error types for GhostWarden.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Subsystem error: {0}")]
    Subsystem(String),
}

impl WardenError {
    /// True for errors that should abort the caller's whole operation
    /// rather than a single IP (credentials stay wrong until an operator
    /// fixes them).
    pub fn is_auth(&self) -> bool {
        matches!(self, WardenError::AuthFailed(_))
    }
}
