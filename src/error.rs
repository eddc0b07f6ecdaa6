//! Error kinds raised by the publication tree

use std::path::PathBuf;

use thiserror::Error;

/// Error conditions the core raises. See the error-handling design notes
/// for the propagation policy: everything except [`TreeError::Network`]
/// propagates to the caller. A generator hitting a network error reports
/// "no payload" instead of surfacing this variant.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupt catalog at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("external tool failed: {0}")]
    External(String),

    #[error("network error: {0}")]
    Network(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TreeError>;

impl TreeError {
    /// True for errors that a generator should translate into "no payload"
    /// rather than propagate.
    pub fn is_network(&self) -> bool {
        matches!(self, TreeError::Network(_))
    }
}
