//! Error types for the bulk copy library.

use crate::encode::EncodeError;
use thiserror::Error;

/// Main error type for bulk copy operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Table could not be resolved or its catalog could not be read.
    #[error("Metadata error for table {table}: {message}")]
    Metadata { table: String, message: String },

    /// Row count or worker count cannot be partitioned.
    #[error("Partition error for table {table}: {message}")]
    Partition { table: String, message: String },

    /// Source query failed while a chunk was being read.
    #[error("Extraction failed for {chunk}: {message}")]
    Extraction { chunk: String, message: String },

    /// A row value could not be rendered into the COPY stream.
    #[error("Encoding failed for {chunk} at row {position}: {source}")]
    Encode {
        chunk: String,
        position: u64,
        #[source]
        source: EncodeError,
    },

    /// Target rejected the COPY stream.
    #[error("Ingestion failed for {chunk}: {message}")]
    Ingestion { chunk: String, message: String },

    /// The reading side of a bridge went away before the stream ended.
    #[error("Stream closed by consumer")]
    StreamClosed,

    /// The writing side of a bridge aborted or vanished before closing.
    #[error("Stream aborted by producer: {0}")]
    StreamAborted(String),

    /// A chunk exceeded its configured deadline.
    #[error("Timed out after {0}s")]
    Timeout(u64),

    /// One or more chunks failed; the run itself completed.
    #[error("{failed} of {planned} chunks failed")]
    ChunksFailed { failed: usize, planned: usize },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Copy was cancelled (SIGINT, etc.)
    #[error("Copy cancelled")]
    Cancelled,
}

/// Process exit codes.
pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_CONNECTION_ERROR: u8 = 2;
pub const EXIT_METADATA_ERROR: u8 = 3;
pub const EXIT_TRANSFER_ERROR: u8 = 4;
pub const EXIT_CANCELLED: u8 = 5;
pub const EXIT_IO_ERROR: u8 = 7;

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Metadata error
    pub fn metadata(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Metadata {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Partition error
    pub fn partition(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Partition {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an Extraction error
    pub fn extraction(chunk: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Extraction {
            chunk: chunk.into(),
            message: message.to_string(),
        }
    }

    /// Create an Ingestion error
    pub fn ingestion(chunk: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Ingestion {
            chunk: chunk.into(),
            message: message.to_string(),
        }
    }

    /// True for errors that only report the other side of a bridge failing.
    pub fn is_derived(&self) -> bool {
        matches!(self, MigrateError::StreamClosed | MigrateError::StreamAborted(_))
    }

    /// Map the error to a process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::Json(_) => {
                EXIT_CONFIG_ERROR
            }
            MigrateError::Source(_) | MigrateError::Target(_) | MigrateError::Pool { .. } => {
                EXIT_CONNECTION_ERROR
            }
            MigrateError::Metadata { .. } | MigrateError::Partition { .. } => EXIT_METADATA_ERROR,
            MigrateError::Extraction { .. }
            | MigrateError::Encode { .. }
            | MigrateError::Ingestion { .. }
            | MigrateError::StreamClosed
            | MigrateError::StreamAborted(_)
            | MigrateError::Timeout(_)
            | MigrateError::ChunksFailed { .. } => EXIT_TRANSFER_ERROR,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for bulk copy operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(MigrateError::metadata("t", "x").exit_code(), EXIT_METADATA_ERROR);
        assert_eq!(MigrateError::Cancelled.exit_code(), EXIT_CANCELLED);
        assert_eq!(
            MigrateError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "x")).exit_code(),
            EXIT_IO_ERROR
        );
        assert_eq!(
            MigrateError::ChunksFailed { failed: 1, planned: 3 }.exit_code(),
            EXIT_TRANSFER_ERROR
        );
    }

    #[test]
    fn test_derived_errors() {
        assert!(MigrateError::StreamClosed.is_derived());
        assert!(MigrateError::StreamAborted("gone".into()).is_derived());
        assert!(!MigrateError::ingestion("c", "bad row").is_derived());
    }

    #[test]
    fn test_format_detailed_includes_cause() {
        let err = MigrateError::Encode {
            chunk: "dbo.t#0".into(),
            position: 3,
            source: EncodeError::new("payload", "NUL byte in text"),
        };
        let detailed = err.format_detailed();
        assert!(detailed.contains("Caused by"));
        assert!(detailed.contains("payload"));
    }
}
