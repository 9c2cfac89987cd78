use thiserror::Error;
use tps_reader::TpsError;

use crate::models::error_handler::{ConversionError, ErrorCategory};

/// Centralized error type for the conversion pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON (de)serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Legacy store error: {0}")]
    Tps(#[from] TpsError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("Too many errors occurred: {critical_errors} critical errors (limit {limit})")]
    Aborted { critical_errors: usize, limit: usize },

    #[error("Recovery exhausted for {category} error: {message}")]
    RecoveryExhausted { category: ErrorCategory, message: String },

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl PipelineError {
    /// Errors that end the whole run rather than a single table
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Aborted { .. } | PipelineError::RecoveryExhausted { .. })
    }
}

/// Alias for fallible operations in the pipeline crate
pub type PipelineResult<T> = Result<T, PipelineError>;
