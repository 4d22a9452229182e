//! Error handling module
//!
//! Provides the unified error taxonomy for every pipeline stage. Errors are
//! serializable so stage results and evidence records can carry them verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline-wide error type
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("Load error: {message}")]
    Load { message: String },

    #[error("Merge conflict at '{path}': {message}")]
    MergeConflict { path: String, message: String },

    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Normalization error: {message}")]
    Normalization { message: String },

    #[error("Validation error at '{path}': {message}")]
    Validation { path: String, message: String },

    #[error("Governance violation: {message}")]
    GovernanceViolation { message: String },

    #[error("Render error: {message}")]
    Render { message: String },

    #[error("Execution error: {message}")]
    Execution { message: String },

    #[error("Rollback error: {message}")]
    Rollback { message: String },

    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("Cancelled: {message}")]
    Cancelled { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },
}

impl PipelineError {
    /// Taxonomy name used in evidence records and CLI output
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Load { .. } | PipelineError::MergeConflict { .. } => "LoadError",
            PipelineError::Parse { .. } => "ParseError",
            PipelineError::Normalization { .. } => "NormalizationError",
            PipelineError::Validation { .. } => "ValidationError",
            PipelineError::GovernanceViolation { .. } => "GovernanceViolation",
            PipelineError::Render { .. } => "RenderError",
            PipelineError::Execution { .. } => "ExecutionError",
            PipelineError::Rollback { .. } => "RollbackError",
            PipelineError::Timeout { .. } => "TimeoutError",
            PipelineError::Cancelled { .. } => "CancelledError",
            PipelineError::NotFound { .. } => "NotFoundError",
            PipelineError::Conflict { .. } => "ConflictError",
            PipelineError::Config { .. } => "ConfigError",
            PipelineError::Io { .. } => "IoError",
        }
    }

    /// Document path the error points at, when it has one
    pub fn path(&self) -> Option<&str> {
        match self {
            PipelineError::MergeConflict { path, .. }
            | PipelineError::Parse { path, .. }
            | PipelineError::Validation { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Io {
            message: format!("serialization failed: {}", e),
        }
    }
}

impl From<tokio::time::error::Elapsed> for PipelineError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        PipelineError::Timeout {
            message: e.to_string(),
        }
    }
}

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Helper function to create a load error
pub fn load_error(msg: impl Into<String>) -> PipelineError {
    PipelineError::Load { message: msg.into() }
}

/// Helper function to create an execution error
pub fn execution_error(msg: impl Into<String>) -> PipelineError {
    PipelineError::Execution { message: msg.into() }
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> PipelineError {
    PipelineError::NotFound { message: msg.into() }
}

/// Helper function to create a conflict error
pub fn conflict_error(msg: impl Into<String>) -> PipelineError {
    PipelineError::Conflict { message: msg.into() }
}
