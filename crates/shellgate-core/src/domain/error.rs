//! Error taxonomy for shellgate.

/// Shellgate errors.
#[derive(Debug, thiserror::Error)]
pub enum ShellgateError {
    #[error("classification ambiguous: {0}")]
    ClassificationAmbiguous(String),

    #[error("sandbox setup failed: {0}")]
    SandboxSetupFailure(String),

    #[error("execution timed out after {limit_ms}ms")]
    ExecutionTimeout { limit_ms: u64 },

    #[error("command exited with status {code}")]
    NonZeroExit { code: i32 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("confirmation declined for {step_id}")]
    ConfirmationDeclined { step_id: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("rollback of {step_id} failed: {reason}")]
    RollbackFailure { step_id: String, reason: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("audit error: {0}")]
    Audit(#[from] crate::audit::AuditError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for shellgate operations.
pub type Result<T> = std::result::Result<T, ShellgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShellgateError::ExecutionTimeout { limit_ms: 500 };
        assert!(err.to_string().contains("500ms"));

        let err = ShellgateError::ConfirmationDeclined {
            step_id: "step-2".to_string(),
        };
        assert!(err.to_string().contains("step-2"));

        let err = ShellgateError::InvalidPlan("plan has no steps".to_string());
        assert!(err.to_string().contains("invalid plan"));
    }

    #[test]
    fn test_rollback_failure_mentions_reason() {
        let err = ShellgateError::RollbackFailure {
            step_id: "step-1".to_string(),
            reason: "target exists".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("step-1"));
        assert!(msg.contains("target exists"));
    }
}
