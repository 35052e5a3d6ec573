//! # Shared Error Type
//!
//! Purpose: Give every crate in the workspace one error vocabulary for
//! startup and I/O failures. Command-level failures never use this type;
//! they are rendered as RESP error replies and the connection keeps going.

use thiserror::Error;

/// Result alias used across the workspace.
pub type FkvResult<T> = Result<T, FkvError>;

/// Errors surfaced outside the command path.
#[derive(Debug, Error)]
pub enum FkvError {
    /// Network or socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value (port range, malformed env var).
    #[error("invalid configuration: {0}")]
    Config(String),
}
