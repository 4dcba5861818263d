//! Error types for the report processor.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building a processor.
///
/// Runtime misuse (duplicate folders, unknown handlers) is reported through
/// boolean returns, not through this type.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("No tokio runtime available: {reason}")]
    NoRuntime { reason: String },

    #[error("Invalid processor configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Invalid file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Errors returned by report handlers.
///
/// A failed delivery is logged and contained to that single delivery.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Cannot process {path}: {reason}")]
    Failed { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

