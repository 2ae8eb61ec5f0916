//! Execution results and outcomes.

use serde::{Deserialize, Serialize};

use super::risk::SandboxMode;
use super::step::StepFailure;
use crate::tracker::StateDiff;

/// Result of running (or predicting) one operation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub state_diff: StateDiff,
    pub mode: SandboxMode,
    /// Captured output hit the size cap.
    #[serde(default)]
    pub output_truncated: bool,
}

impl ExecutionResult {
    /// Result of a DryRun: nothing ran, the diff is a prediction.
    pub fn predicted(state_diff: StateDiff) -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            state_diff,
            mode: SandboxMode::DryRun,
            output_truncated: false,
        }
    }
}

/// What the executor hands back for a request. Never a panic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed(ExecutionResult),
    Failed {
        failure: StepFailure,
        /// Whatever was observed before the failure, if the process ran.
        partial: Option<ExecutionResult>,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Failed { partial, .. } => partial.as_ref(),
        }
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        match self {
            Self::Completed(_) => None,
            Self::Failed { failure, .. } => Some(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::step::FailureKind;

    #[test]
    fn test_predicted_result_is_dry_run() {
        let result = ExecutionResult::predicted(StateDiff::default());
        assert_eq!(result.mode, SandboxMode::DryRun);
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn test_failed_outcome_exposes_partial() {
        let partial = ExecutionResult {
            exit_code: 3,
            stdout: String::new(),
            stderr: "boom".into(),
            duration_ms: 12,
            state_diff: StateDiff::default(),
            mode: SandboxMode::Isolated,
            output_truncated: false,
        };
        let outcome = ExecutionOutcome::Failed {
            failure: StepFailure::new(
                FailureKind::NonZeroExit { code: 3 },
                SandboxMode::Isolated,
                None,
                "exit 3",
            ),
            partial: Some(partial),
        };
        assert!(!outcome.is_success());
        assert_eq!(outcome.result().map(|r| r.exit_code), Some(3));
        assert!(outcome.failure().is_some());
    }
}
