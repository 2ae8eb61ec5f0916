//! Error types for the sandbox and change-tracking layers.

use crate::domain::{FailureKind, SandboxMode};

/// Errors produced while preparing or running a sandboxed execution.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("overlay setup failed: {0}")]
    Overlay(String),

    #[error("snapshot of {path} failed: {reason}")]
    Snapshot { path: String, reason: String },

    #[error("resource surface exceeds {limit} entries")]
    SurfaceTooLarge { limit: usize },

    #[error("failed to spawn process: {0}")]
    Spawn(std::io::Error),

    #[error("resource lock unavailable: {0}")]
    Lock(String),

    #[error("system probe failed: {0}")]
    Probe(String),

    #[error("{category} operations cannot run under {mode}")]
    Unsupported { mode: SandboxMode, category: String },

    #[error("executor worker unavailable")]
    WorkerGone,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Step failure kind this error is reported as.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Spawn(e) | Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                FailureKind::PermissionDenied
            }
            _ => FailureKind::SandboxSetupFailure,
        }
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_spawn_maps_to_permission_kind() {
        let err = SandboxError::Spawn(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(err.failure_kind(), FailureKind::PermissionDenied);
    }

    #[test]
    fn test_setup_errors_map_to_setup_failure() {
        let err = SandboxError::SurfaceTooLarge { limit: 10 };
        assert_eq!(err.failure_kind(), FailureKind::SandboxSetupFailure);
        assert!(err.to_string().contains("10 entries"));
    }

    #[test]
    fn test_unsupported_display() {
        let err = SandboxError::Unsupported {
            mode: SandboxMode::Simulation,
            category: "network".into(),
        };
        assert_eq!(err.to_string(), "network operations cannot run under simulation");
    }
}
