//! Error types for skiff.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::Stage;

/// Result type alias for skiff operations.
pub type Result<T> = std::result::Result<T, SkiffError>;

/// Main error type for skiff.
#[derive(Error, Debug)]
pub enum SkiffError {
    // Build context assembly errors. Fatal to the request; no pipeline run starts.
    #[error("Failed to assemble build context at {path:?}: {reason}")]
    Context { path: PathBuf, reason: String },

    #[error("Path {path:?} escapes the build context root")]
    ContextEscape { path: PathBuf },

    #[error("Invalid ignore pattern {pattern:?}: {reason}")]
    InvalidIgnorePattern { pattern: String, reason: String },

    // Request validation errors. Fatal; no pipeline run starts.
    #[error("Invalid build request: {reason}")]
    Validation { reason: String },

    // Stage errors, produced by a delegated external collaborator. Each maps
    // to exactly one terminal Failure summary for its stage.
    #[error("Image build failed: {reason}")]
    BuildFailed { reason: String },

    #[error("Image push failed: {reason}")]
    PushFailed { reason: String },

    #[error("Chart release failed: {reason}")]
    ReleaseFailed { reason: String },

    // The run was aborted by context cancellation before reaching a natural
    // terminal state.
    #[error("Build cancelled during {stage}")]
    Cancelled { stage: Stage },

    // Transport errors mean "we don't know the outcome". They are never
    // mapped onto a Failure summary.
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    // Storage errors. AppNotFound and BuildNotFound are distinguished by
    // which entity failed to resolve.
    #[error("No builds recorded for application {app:?}")]
    AppNotFound { app: String },

    #[error("Build {build_id:?} not found for application {app:?}")]
    BuildNotFound { app: String, build_id: String },

    #[error("Concurrent write conflict persisting build for application {app:?}")]
    StorageConflict { app: String },

    #[error("Storage backend unavailable: {reason}")]
    StorageUnavailable { reason: String },

    // Values / chart configuration errors
    #[error("Invalid values: {reason}")]
    InvalidValues { reason: String },

    // Manifest / configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SkiffError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// The stage error variant for `stage`, wrapping `reason`.
    pub fn stage_failed(stage: Stage, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match stage {
            Stage::BuildImage => Self::BuildFailed { reason },
            Stage::PushImage => Self::PushFailed { reason },
            Stage::ReleaseChart => Self::ReleaseFailed { reason },
        }
    }

    /// True for NotFound-class storage errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::AppNotFound { .. } | Self::BuildNotFound { .. })
    }
}
