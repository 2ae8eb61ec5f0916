//! Error types for the audit log

use thiserror::Error;

/// Errors raised while appending to or reading the audit log
#[derive(Error, Debug)]
pub enum AuditError {
    /// Underlying file I/O failed
    #[error("audit I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// An entry could not be encoded or decoded
    #[error("audit serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A complete line in the log is not a valid entry
    #[error("audit log corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    /// Hash chain verification failed
    #[error("audit chain broken at seq {seq}: {reason}")]
    ChainBroken { seq: u64, reason: String },

    /// The store refused the write (used by fakes and closed stores)
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for audit operations
pub type AuditResult<T> = std::result::Result<T, AuditError>;
