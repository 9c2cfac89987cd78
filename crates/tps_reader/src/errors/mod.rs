use thiserror::Error;

/// Centralized error type for the legacy store reader
#[derive(Error, Debug)]
pub enum TpsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file header: {0}")]
    InvalidHeader(String),

    #[error("Invalid page at offset {offset:#x}: {reason}")]
    InvalidPage { offset: u32, reason: String },

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Record parsing error: {0}")]
    RecordParsing(String),

    #[error("Definition parsing error: {0}")]
    DefinitionParsing(String),

    #[error("Unknown text encoding: {0}")]
    UnknownEncoding(String),

    #[error("Unknown table: {0}")]
    UnknownTable(u32),

    #[error("Layout error: {0}")]
    Layout(String),
}

impl TpsError {
    pub fn invalid_page<S: Into<String>>(offset: u32, reason: S) -> Self {
        TpsError::InvalidPage {
            offset,
            reason: reason.into(),
        }
    }
}

/// Alias for fallible operations in the reader crate
pub type TpsResult<T> = Result<T, TpsError>;
