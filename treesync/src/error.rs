//! Error types for the sync engine library

use std::path::PathBuf;

use crate::store::StoreError;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for sync operations
///
/// `Access` and `Planning` are fatal: they abort a run before any transfer
/// is attempted. `Transfer` is scoped to a single action and is recorded in
/// the run summary instead of stopping the run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A sync root (local directory or remote prefix) cannot be read or listed
    #[error("Cannot access '{location}': {message}")]
    Access { location: String, message: String },

    /// An enumerated entry cannot be planned (unsupported type, bad name, bad order)
    #[error("Planning error at '{path}': {message}")]
    Planning { path: String, message: String },

    /// A single action failed
    #[error("Transfer of '{path}' failed: {message}")]
    Transfer { path: String, message: String },

    /// Object storage errors
    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid run configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cancellation error
    #[error("Operation was cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a new access error
    pub fn access_error(location: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Access {
            location: location.to_string(),
            message: message.into(),
        }
    }

    /// Create a new planning error
    pub fn planning_error(path: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Planning {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Create a new transfer error
    pub fn transfer_error(path: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Transfer {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an access error for a local path
    pub fn local_access_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::access_error(path.into().display(), message)
    }

    /// Whether this error aborts the whole run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transfer { .. })
    }

    /// The reason recorded in a run summary for a failed action
    pub fn reason(&self) -> String {
        match self {
            Self::Transfer { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
