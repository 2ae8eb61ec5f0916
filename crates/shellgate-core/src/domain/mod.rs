//! Domain models for shellgate.
//!
//! - `Operation`: an analysed candidate shell command
//! - `RiskProfile` / `SandboxMode`: the classifier's verdict
//! - `Step` / `Plan`: sequencing and lifecycle
//! - `ExecutionResult` / `ExecutionOutcome`: what running a step produced

pub mod error;
pub mod lexer;
pub mod operation;
pub mod plan;
pub mod result;
pub mod risk;
pub mod step;

pub use error::{Result, ShellgateError};
pub use operation::{Command, CommandAction, Operation, OperationCategory, OperationResources};
pub use plan::{
    FailurePolicy, Plan, PlanReport, PlanStatus, PlanSubmission, StepReport, StepSubmission,
};
pub use result::{ExecutionOutcome, ExecutionResult};
pub use risk::{MatchedRule, RiskLevel, RiskProfile, SandboxMode};
pub use step::{
    ConfirmationDecision, ConfirmationRecord, FailureKind, PreflightRecord, Step, StepFailure,
    StepId, StepStatus,
};
