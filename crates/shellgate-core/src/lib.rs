//! Shellgate Core Library
//!
//! Risk classification and graduated-sandbox execution of shell operations,
//! with plan orchestration, rollback and a hash-chained audit log.

pub mod audit;
pub mod cancel;
pub mod classifier;
pub mod domain;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod policy;
pub mod sandbox;
pub mod telemetry;
pub mod tracker;

pub use domain::{
    Command, CommandAction, ConfirmationDecision, ConfirmationRecord, ExecutionOutcome,
    ExecutionResult, FailureKind, FailurePolicy, MatchedRule, Operation, OperationCategory,
    Plan, PlanReport, PlanStatus, PlanSubmission, PreflightRecord, Result, RiskLevel,
    RiskProfile, SandboxMode, ShellgateError, Step, StepFailure, StepId, StepReport, StepStatus,
    StepSubmission,
};

pub use audit::{
    AuditEntry, AuditError, AuditLog, AuditOutcome, AuditRecord, JsonlAuditLog, MemoryAuditLog,
};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use classifier::{Classifier, RiskRule, RuleMatcher, RuleSet};
pub use orchestrator::{
    ConfirmationChannel, ConfirmationRequest, InverseAction, Orchestrator, RollbackPlan,
    RollbackRecord, ScriptedConfirmer,
};
pub use policy::PolicyContext;
pub use sandbox::{spawn_executor, ExecRequest, ExecutorHandle, SandboxError, SandboxExecutor};
pub use tracker::{predict, ChangeTracker, ResourceSet, SnapshotHandle, StateDiff, StaticProbe};
