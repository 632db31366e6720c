use std::path::PathBuf;
use thiserror::Error as ThisError;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    /// A required input file does not exist
    #[error("{resource} not found at '{}'", path.display())]
    NotFound { resource: String, path: PathBuf },

    /// A file exists but could not be read or written
    #[error("Failed to {operation} '{}': {source}", path.display())]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed CSV input or a failure while encoding CSV output
    #[error("CSV error in '{}': {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// A table is missing a column the stage depends on
    #[error("Column '{column}' not found in {table}")]
    MissingColumn { column: String, table: String },

    /// Input data violates a structural expectation
    #[error("{message}")]
    BadInput { message: String },

    /// Two tasks in the same batch resolved to the same custom id
    #[error("Duplicate custom_id '{custom_id}' (rows {first_row} and {second_row})")]
    DuplicateCustomId {
        custom_id: String,
        first_row: usize,
        second_row: usize,
    },

    /// No usable record survived parsing of a result file
    #[error("No valid results could be extracted from '{}'", path.display())]
    EmptyResults { path: PathBuf },

    /// Positional join would read past the end of the table
    #[error("Result index {index} is out of range for a table of {rows} rows; the table no longer matches the submitted batch")]
    Misaligned { index: usize, rows: usize },

    /// The table being reconciled is not the one the batch was built from
    #[error("Table snapshot mismatch: {message}")]
    SnapshotMismatch { message: String },

    /// The remote API answered with a non-success status
    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Config validation: {message}")]
    Config { message: String },
}

impl Error {
    /// Build an [`Error::Io`], turning `NotFound` into [`Error::NotFound`] so callers
    /// can tell a missing input from an unreadable one.
    pub fn io(operation: &str, resource: &str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound {
                resource: resource.to_string(),
                path,
            }
        } else {
            Error::Io {
                operation: operation.to_string(),
                path,
                source,
            }
        }
    }

    /// Process exit code for this error when it terminates the binary.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::EmptyResults { .. } => 2,
            Error::NotFound { .. } => 3,
            Error::Misaligned { .. } | Error::SnapshotMismatch { .. } => 4,
            _ => 1,
        }
    }
}
