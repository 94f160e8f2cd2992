//! Error types for blackhole-ingest
//!
//! Every failure the engine reports to a caller is one `IngestError` variant.
//! `ErrorReport` is the outbound `{kind, message, retryable}` shape handed to
//! whatever transport sits in front of the engine.

use serde::Serialize;
use thiserror::Error;

/// Ingest engine error
#[derive(Debug, Error)]
pub enum IngestError {
    /// Malformed request; rejected synchronously without side effects
    #[error("Validation error: {0}")]
    Validation(String),

    /// A sample in the batch is malformed; whole batch rejected
    #[error("Schema invalid: {0}")]
    SchemaInvalid(String),

    /// Batch rate differs from the take's declared rate
    #[error("Rate mismatch: take declares {declared}, batch implies {batch}")]
    RateMismatch { declared: String, batch: String },

    /// Another session owns the take id
    #[error("Lock conflict: take '{0}' is held by another session")]
    LockConflict(String),

    /// Operation not allowed in the session's current state
    #[error("Busy: {0}")]
    Busy(String),

    /// File or row write failed
    #[error("Write failure: {0}")]
    WriteFailure(String),

    /// Deadline elapsed; final state unknown, re-query the take
    #[error("Timeout: finalize of take '{0}' still in progress, re-query status")]
    Timeout(String),

    /// File store and metadata store disagree
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Unknown take id or stale handle
    #[error("Not found: {0}")]
    NotFound(String),

    /// blackhole-common error
    #[error("Common error: {0}")]
    Common(#[from] blackhole_common::Error),
}

impl IngestError {
    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "VALIDATION_ERROR",
            IngestError::SchemaInvalid(_) => "SCHEMA_INVALID",
            IngestError::RateMismatch { .. } => "RATE_MISMATCH",
            IngestError::LockConflict(_) => "LOCK_CONFLICT",
            IngestError::Busy(_) => "BUSY",
            IngestError::WriteFailure(_) => "WRITE_FAILURE",
            IngestError::Timeout(_) => "TIMEOUT",
            IngestError::ConsistencyViolation(_) => "CONSISTENCY_VIOLATION",
            IngestError::NotFound(_) => "NOT_FOUND",
            IngestError::Common(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn retryable(&self) -> bool {
        matches!(self, IngestError::LockConflict(_) | IngestError::Busy(_))
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.retryable(),
        }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Common(blackhole_common::Error::Io(err))
    }
}

/// Structured error returned to callers
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}

/// Result type for ingest operations
pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_conflict_is_retryable() {
        let report = IngestError::LockConflict("take07".to_string()).report();
        assert_eq!(report.kind, "LOCK_CONFLICT");
        assert!(report.retryable);
        assert!(report.message.contains("take07"));
    }

    #[test]
    fn test_write_failure_is_not_retryable() {
        assert!(!IngestError::WriteFailure("disk full".to_string()).retryable());
        assert!(!IngestError::Timeout("t".to_string()).retryable());
        assert!(!IngestError::SchemaInvalid("x".to_string()).retryable());
    }

    #[test]
    fn test_report_serializes() {
        let report = IngestError::Busy("finalizing".to_string()).report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "BUSY");
        assert_eq!(json["retryable"], true);
    }
}
