//! Steps, their lifecycle and the records that clear them for execution.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Result, ShellgateError};
use super::operation::Operation;
use super::result::ExecutionResult;
use super::risk::{RiskProfile, SandboxMode};

/// Step identifier, 1-based within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u32);

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step-{}", self.0)
    }
}

/// Why a step did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    Timeout { limit_ms: u64 },
    NonZeroExit { code: i32 },
    SandboxSetupFailure,
    PermissionDenied,
    Cancelled,
    ConfirmationDeclined,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { limit_ms } => write!(f, "timeout ({limit_ms}ms)"),
            Self::NonZeroExit { code } => write!(f, "non-zero exit ({code})"),
            Self::SandboxSetupFailure => write!(f, "sandbox setup failure"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ConfirmationDeclined => write!(f, "confirmation declined"),
        }
    }
}

/// A step-level failure. Carries the profile reasons and the mode attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub mode: SandboxMode,
    pub reasons: Vec<String>,
    pub message: String,
}

impl StepFailure {
    pub fn new(
        kind: FailureKind,
        mode: SandboxMode,
        profile: Option<&RiskProfile>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            mode,
            reasons: profile.map(RiskProfile::reason_texts).unwrap_or_default(),
            message: message.into(),
        }
    }

    /// Convert into the crate error for `Result`-shaped callers.
    pub fn into_error(self, step_id: StepId) -> ShellgateError {
        match self.kind {
            FailureKind::Timeout { limit_ms } => ShellgateError::ExecutionTimeout { limit_ms },
            FailureKind::NonZeroExit { code } => ShellgateError::NonZeroExit { code },
            FailureKind::SandboxSetupFailure => ShellgateError::SandboxSetupFailure(self.message),
            FailureKind::PermissionDenied => ShellgateError::PermissionDenied(self.message),
            FailureKind::Cancelled => ShellgateError::Cancelled(format!("{step_id}: {}", self.message)),
            FailureKind::ConfirmationDeclined => ShellgateError::ConfirmationDeclined {
                step_id: step_id.to_string(),
            },
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} under {}: {}", self.kind, self.mode, self.message)
    }
}

/// Lifecycle of a step.
///
/// `Pending -> Classified -> (AwaitingConfirmation) -> Approved -> Running ->
/// {Succeeded | Failed}`; `Cancelled` and `Skipped` are reachable before
/// execution starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "failure", rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Classified,
    AwaitingConfirmation,
    Approved,
    Running,
    Succeeded,
    Failed(FailureKind),
    Cancelled,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed(_) | Self::Cancelled | Self::Skipped
        )
    }

    /// Whether the step ended without succeeding.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Cancelled | Self::Skipped)
    }

    pub fn can_transition_to(&self, next: &StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Classified | Cancelled | Skipped)
                | (Classified, AwaitingConfirmation | Approved | Cancelled | Skipped)
                | (AwaitingConfirmation, Approved | Cancelled)
                | (Approved, Running | Failed(_) | Cancelled)
                | (Running, Succeeded | Failed(_))
        )
    }

    pub fn label(&self) -> String {
        match self {
            Self::Pending => "pending".into(),
            Self::Classified => "classified".into(),
            Self::AwaitingConfirmation => "awaiting_confirmation".into(),
            Self::Approved => "approved".into(),
            Self::Running => "running".into(),
            Self::Succeeded => "succeeded".into(),
            Self::Failed(kind) => format!("failed({kind})"),
            Self::Cancelled => "cancelled".into(),
            Self::Skipped => "skipped".into(),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// User decision on a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationDecision {
    Approve,
    Decline,
    ApproveAllRemaining,
}

impl ConfirmationDecision {
    pub fn is_approval(self) -> bool {
        matches!(self, Self::Approve | Self::ApproveAllRemaining)
    }
}

/// Evidence that a user explicitly approved a specific operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub step_id: StepId,
    pub decision: ConfirmationDecision,
    /// Granted by an earlier approve-all-remaining decision.
    pub blanket: bool,
    pub operation_digest: String,
    pub decided_at: DateTime<Utc>,
}

impl ConfirmationRecord {
    pub fn new(
        step_id: StepId,
        decision: ConfirmationDecision,
        blanket: bool,
        operation: &Operation,
    ) -> Self {
        Self {
            step_id,
            decision,
            blanket,
            operation_digest: operation.digest(),
            decided_at: Utc::now(),
        }
    }

    /// Whether this record approves `operation` for `step_id`.
    pub fn approves(&self, step_id: StepId, operation: &Operation) -> bool {
        self.step_id == step_id
            && self.decision.is_approval()
            && self.operation_digest == operation.digest()
    }
}

/// Outcome of the Simulation run that precedes a Validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightRecord {
    pub step_id: StepId,
    pub mode: SandboxMode,
    pub succeeded: bool,
    pub operation_digest: String,
    pub diff_summary: String,
}

impl PreflightRecord {
    pub fn clears(&self, step_id: StepId, operation: &Operation) -> bool {
        self.step_id == step_id && self.succeeded && self.operation_digest == operation.digest()
    }
}

/// One operation plus its classification and execution state.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: StepId,
    pub operation: Operation,
    pub risk_profile: Option<RiskProfile>,
    status: StepStatus,
    pub dependencies: BTreeSet<StepId>,
    pub result: Option<ExecutionResult>,
    pub failure: Option<StepFailure>,
    pub mode_used: Option<SandboxMode>,
    pub confirmation: Option<ConfirmationRecord>,
    pub preflight: Option<PreflightRecord>,
}

impl Step {
    pub fn new(id: StepId, operation: Operation, dependencies: BTreeSet<StepId>) -> Self {
        Self {
            id,
            operation,
            risk_profile: None,
            status: StepStatus::Pending,
            dependencies,
            result: None,
            failure: None,
            mode_used: None,
            confirmation: None,
            preflight: None,
        }
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: StepStatus) -> Result<()> {
        if !self.status.can_transition_to(&next) {
            return Err(ShellgateError::InvalidPlan(format!(
                "{}: illegal transition {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step() -> Step {
        Step::new(StepId(1), Operation::new("ls", None, "/"), BTreeSet::new())
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = step();
        s.transition(StepStatus::Classified).unwrap();
        s.transition(StepStatus::AwaitingConfirmation).unwrap();
        s.transition(StepStatus::Approved).unwrap();
        s.transition(StepStatus::Running).unwrap();
        s.transition(StepStatus::Succeeded).unwrap();
        assert!(s.status().is_terminal());
    }

    #[test]
    fn test_cannot_run_unapproved_step() {
        let mut s = step();
        s.transition(StepStatus::Classified).unwrap();
        let err = s.transition(StepStatus::Running).unwrap_err();
        assert!(err.to_string().contains("illegal transition"));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut s = step();
        s.transition(StepStatus::Skipped).unwrap();
        assert!(s.transition(StepStatus::Classified).is_err());
    }

    #[test]
    fn test_confirmation_bound_to_operation() {
        let op = Operation::new("rm -rf /srv/data", None, "/");
        let other = Operation::new("rm -rf /srv/other", None, "/");
        let record = ConfirmationRecord::new(StepId(2), ConfirmationDecision::Approve, false, &op);
        assert!(record.approves(StepId(2), &op));
        assert!(!record.approves(StepId(3), &op));
        assert!(!record.approves(StepId(2), &other));
    }

    #[test]
    fn test_failure_maps_to_error() {
        let failure = StepFailure::new(
            FailureKind::Timeout { limit_ms: 300 },
            SandboxMode::Isolated,
            None,
            "killed after timeout",
        );
        assert!(matches!(
            failure.into_error(StepId(2)),
            ShellgateError::ExecutionTimeout { limit_ms: 300 }
        ));
    }

    #[test]
    fn test_status_serde_shape() {
        let json = serde_json::to_value(StepStatus::Failed(FailureKind::NonZeroExit { code: 2 })).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["failure"]["kind"], "non_zero_exit");
        assert_eq!(json["failure"]["code"], 2);
    }
}
