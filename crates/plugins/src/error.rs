//! Registry and executor error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from catalog operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The manifest is missing fields, has duplicates or fails to parse.
    #[error("invalid manifest {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    /// An action declares a script that does not exist.
    #[error("entry point for action '{action}' missing: {path}")]
    EntryPointMissing { action: String, path: PathBuf },

    /// The manifest's integrity block does not match its content.
    #[error("integrity mismatch for plugin '{id}': expected {expected}, computed {actual}")]
    IntegrityMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// No plugin with this id in the scope.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// Neither the caller's scope nor the system scope defines the action.
    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("plugin io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plugin json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RegistryError::ManifestInvalid {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised before or instead of producing an `ActionResult`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// Arguments do not satisfy the action's parameter contract.
    #[error("invalid argument '{field}': {reason}")]
    ArgumentInvalid { field: String, reason: String },

    /// The caller cancelled, or the executor shut down, before the action ran.
    #[error("action cancelled")]
    Cancelled,
}

/// Failure of `ActionExecutor::run`: resolution or execution
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
