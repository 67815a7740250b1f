//! Error types for NSDb

use thiserror::Error;

/// Result type alias for NSDb operations
pub type Result<T> = std::result::Result<T, NsdbError>;

/// NSDb error types
#[derive(Error, Debug)]
pub enum NsdbError {
    /// Statement could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Statement is well-formed but invalid against the schema
    #[error("plan error: {0}")]
    Plan(String),

    /// Record or schema update is incompatible with the stored schema
    #[error("schema conflict on metric {metric}: {}", conflicts.join(", "))]
    SchemaConflict {
        metric: String,
        conflicts: Vec<String>,
    },

    /// Metric has no schema (never written)
    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    /// Namespace does not exist
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    /// Durable I/O failure
    #[error("index I/O error: {0}")]
    IndexIo(#[from] std::io::Error),

    /// Request deadline exceeded
    #[error("deadline exceeded after {0:?}")]
    Timeout(std::time::Duration),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid on-disk or wire data
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Checksum mismatch on a persisted file
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Unexpected invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl NsdbError {
    /// Check if the operation may succeed on a later retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, NsdbError::IndexIo(_) | NsdbError::Timeout(_))
    }

    /// Check if error indicates corrupted persisted state
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            NsdbError::InvalidFormat(_) | NsdbError::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io: NsdbError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(io.is_retryable());
        assert!(!io.is_corruption());

        let conflict = NsdbError::SchemaConflict {
            metric: "m".into(),
            conflicts: vec!["name: expected VARCHAR dimension, got INT dimension".into()],
        };
        assert!(!conflict.is_retryable());
        assert!(conflict.to_string().contains("name"));

        let checksum = NsdbError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        };
        assert!(checksum.is_corruption());
    }
}
