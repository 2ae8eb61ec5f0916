//! Plans: submissions, validated step sequences and their reports.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{Result, ShellgateError};
use super::operation::{Operation, OperationCategory};
use super::result::ExecutionResult;
use super::risk::{RiskProfile, SandboxMode};
use super::step::{PreflightRecord, Step, StepFailure, StepId, StepStatus};
use crate::orchestrator::rollback::RollbackRecord;

/// What to do with the rest of a plan when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip every remaining step.
    #[default]
    AbortOnFailure,
    /// Skip only steps that depend on the failed step.
    ContinueSkippingDependents,
}

/// One candidate operation as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSubmission {
    pub command: String,
    /// Caller's claim about the category. Recorded, never trusted.
    #[serde(default)]
    pub category_hint: Option<String>,
    /// 1-based numbers of earlier steps this step depends on.
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

impl StepSubmission {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            category_hint: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.category_hint = Some(hint.into());
        self
    }

    pub fn depends_on(mut self, steps: impl IntoIterator<Item = u32>) -> Self {
        self.depends_on.extend(steps);
        self
    }
}

/// An ordered list of candidate operations plus plan options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSubmission {
    pub steps: Vec<StepSubmission>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Minimum effective mode for every step. Falls back to the policy default.
    #[serde(default)]
    pub mode_floor: Option<SandboxMode>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl PlanSubmission {
    pub fn new(steps: Vec<StepSubmission>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_floor(mut self, floor: SandboxMode) -> Self {
        self.mode_floor = Some(floor);
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Overall plan status, derived from step statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Some independent step failed but nothing was skipped because of it.
    CompletedWithFailures,
    Cancelled,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::CompletedWithFailures => "completed_with_failures",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A validated plan. Owns its steps.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: Uuid,
    pub steps: Vec<Step>,
    pub failure_policy: FailurePolicy,
    pub mode_floor: SandboxMode,
    /// Set when the whole plan was cancelled by the caller.
    pub cancelled: bool,
}

impl Plan {
    /// Validate a submission and build its steps.
    ///
    /// Dependencies must name earlier steps, which also rules out cycles.
    pub fn from_submission(
        submission: PlanSubmission,
        default_floor: SandboxMode,
        cwd: &Path,
    ) -> Result<Self> {
        if submission.steps.is_empty() {
            return Err(ShellgateError::InvalidPlan("plan has no steps".to_string()));
        }

        let cwd = submission.working_dir.as_deref().unwrap_or(cwd);
        let mut steps = Vec::with_capacity(submission.steps.len());
        for (index, sub) in submission.steps.into_iter().enumerate() {
            let number = index as u32 + 1;
            if sub.command.trim().is_empty() {
                return Err(ShellgateError::InvalidPlan(format!(
                    "step-{number} has an empty command"
                )));
            }
            let mut dependencies = BTreeSet::new();
            for dep in sub.depends_on {
                if dep == 0 || dep >= number {
                    return Err(ShellgateError::InvalidPlan(format!(
                        "step-{number} depends on step-{dep}, which is not an earlier step"
                    )));
                }
                dependencies.insert(StepId(dep));
            }
            let hint = sub.category_hint.as_deref().and_then(|h| match h.parse::<OperationCategory>() {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(step = number, hint = h, error = %e, "ignoring category hint");
                    None
                }
            });
            let operation = Operation::new(sub.command, hint, cwd);
            steps.push(Step::new(StepId(number), operation, dependencies));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            steps,
            failure_policy: submission.failure_policy,
            mode_floor: submission.mode_floor.unwrap_or(default_floor),
            cancelled: false,
        })
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps that depend on `id`, directly or through other steps.
    pub fn dependents_of(&self, id: StepId) -> BTreeSet<StepId> {
        let mut found: BTreeSet<StepId> = BTreeSet::new();
        found.insert(id);
        // Dependencies only point backwards, so one forward pass is enough.
        for step in &self.steps {
            if step.dependencies.iter().any(|d| found.contains(d)) {
                found.insert(step.id);
            }
        }
        found.remove(&id);
        found
    }

    /// Derive the overall status from step statuses.
    pub fn status(&self) -> PlanStatus {
        if self.cancelled {
            return PlanStatus::Cancelled;
        }
        let statuses: Vec<StepStatus> = self.steps.iter().map(Step::status).collect();
        if statuses.iter().all(|s| *s == StepStatus::Succeeded) {
            return PlanStatus::Succeeded;
        }
        if statuses.iter().any(|s| !s.is_terminal()) {
            return if statuses.iter().all(|s| *s == StepStatus::Pending) {
                PlanStatus::Pending
            } else {
                PlanStatus::Running
            };
        }

        let failed: Vec<StepId> = self
            .steps
            .iter()
            .filter(|s| matches!(s.status(), StepStatus::Failed(_)))
            .map(|s| s.id)
            .collect();
        let skipped: HashSet<StepId> = self
            .steps
            .iter()
            .filter(|s| s.status() == StepStatus::Skipped)
            .map(|s| s.id)
            .collect();

        if !failed.is_empty() {
            let caused_skip = failed
                .iter()
                .any(|id| self.dependents_of(*id).iter().any(|d| skipped.contains(d)));
            if self.failure_policy == FailurePolicy::AbortOnFailure || caused_skip {
                return PlanStatus::Failed;
            }
        }
        if statuses.contains(&StepStatus::Cancelled) {
            return PlanStatus::Cancelled;
        }
        PlanStatus::CompletedWithFailures
    }
}

/// Per-step view returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: StepId,
    pub command: String,
    pub normalized: String,
    pub category: OperationCategory,
    pub status: StepStatus,
    pub risk_profile: Option<RiskProfile>,
    pub mode_used: Option<SandboxMode>,
    pub result: Option<ExecutionResult>,
    pub failure: Option<StepFailure>,
    pub preflight: Option<PreflightRecord>,
}

impl From<&Step> for StepReport {
    fn from(step: &Step) -> Self {
        Self {
            step_id: step.id,
            command: step.operation.raw().to_string(),
            normalized: step.operation.normalized().to_string(),
            category: step.operation.category(),
            status: step.status(),
            risk_profile: step.risk_profile.clone(),
            mode_used: step.mode_used,
            result: step.result.clone(),
            failure: step.failure.clone(),
            preflight: step.preflight.clone(),
        }
    }
}

/// Outcome of a plan run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan_id: Uuid,
    pub status: PlanStatus,
    pub failure_policy: FailurePolicy,
    pub mode_floor: SandboxMode,
    pub steps: Vec<StepReport>,
    #[serde(default)]
    pub rollbacks: Vec<RollbackRecord>,
}

impl PlanReport {
    pub fn from_plan(plan: &Plan, rollbacks: Vec<RollbackRecord>) -> Self {
        Self {
            plan_id: plan.id,
            status: plan.status(),
            failure_policy: plan.failure_policy,
            mode_floor: plan.mode_floor,
            steps: plan.steps.iter().map(StepReport::from).collect(),
            rollbacks,
        }
    }

    pub fn step(&self, id: StepId) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_id == id)
    }

    /// A rollback failed or left irreversible changes; the report is
    /// complete but the system may be partially changed.
    pub fn degraded(&self) -> bool {
        self.rollbacks.iter().any(|r| !r.restored())
    }

    /// `Ok` when the plan succeeded. Otherwise a failed rollback, then the
    /// first step failure.
    pub fn into_result(self) -> Result<Self> {
        if self.status == PlanStatus::Succeeded {
            return Ok(self);
        }
        if let Some(rollback) = self.rollbacks.iter().find(|r| !r.restored()) {
            return Err(ShellgateError::RollbackFailure {
                step_id: rollback.step_id.to_string(),
                reason: rollback
                    .error
                    .clone()
                    .unwrap_or_else(|| rollback.summary()),
            });
        }
        let first = self
            .steps
            .iter()
            .find_map(|s| s.failure.clone().map(|f| (s.step_id, f)));
        match first {
            Some((id, failure)) => Err(failure.into_error(id)),
            None => Err(ShellgateError::Cancelled(format!(
                "plan {} ended {}",
                self.plan_id, self.status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::step::FailureKind;

    fn plan(commands: &[(&str, &[u32])], policy: FailurePolicy) -> Plan {
        let steps = commands
            .iter()
            .map(|(c, deps)| StepSubmission::new(*c).depends_on(deps.iter().copied()))
            .collect();
        Plan::from_submission(
            PlanSubmission::new(steps).with_policy(policy),
            SandboxMode::Isolated,
            Path::new("/work"),
        )
        .unwrap()
    }

    fn force(plan: &mut Plan, index: usize, path: &[StepStatus]) {
        for status in path {
            plan.steps[index].transition(*status).unwrap();
        }
    }

    const RUN: [StepStatus; 3] = [StepStatus::Classified, StepStatus::Approved, StepStatus::Running];

    #[test]
    fn test_empty_plan_rejected() {
        let err = Plan::from_submission(PlanSubmission::default(), SandboxMode::Isolated, Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, ShellgateError::InvalidPlan(_)));
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let sub = PlanSubmission::new(vec![StepSubmission::new("ls").depends_on([2]), StepSubmission::new("pwd")]);
        assert!(Plan::from_submission(sub, SandboxMode::Isolated, Path::new("/")).is_err());
    }

    #[test]
    fn test_bad_hint_is_ignored() {
        let sub = PlanSubmission::new(vec![StepSubmission::new("ls").with_hint("nonsense")]);
        let plan = Plan::from_submission(sub, SandboxMode::Isolated, Path::new("/")).unwrap();
        assert_eq!(plan.steps[0].operation.declared_category(), None);
    }

    #[test]
    fn test_dependents_are_transitive() {
        let p = plan(&[("a", &[]), ("b", &[1]), ("c", &[2]), ("d", &[])], FailurePolicy::ContinueSkippingDependents);
        let deps = p.dependents_of(StepId(1));
        assert_eq!(deps, [StepId(2), StepId(3)].into_iter().collect());
    }

    #[test]
    fn test_status_all_succeeded() {
        let mut p = plan(&[("a", &[]), ("b", &[])], FailurePolicy::AbortOnFailure);
        assert_eq!(p.status(), PlanStatus::Pending);
        for i in 0..2 {
            force(&mut p, i, &RUN);
            force(&mut p, i, &[StepStatus::Succeeded]);
        }
        assert_eq!(p.status(), PlanStatus::Succeeded);
    }

    #[test]
    fn test_status_failed_under_abort() {
        let mut p = plan(&[("a", &[]), ("b", &[])], FailurePolicy::AbortOnFailure);
        force(&mut p, 0, &RUN);
        force(&mut p, 0, &[StepStatus::Failed(FailureKind::NonZeroExit { code: 1 })]);
        force(&mut p, 1, &[StepStatus::Skipped]);
        assert_eq!(p.status(), PlanStatus::Failed);
    }

    #[test]
    fn test_status_independent_failure_completes() {
        let mut p = plan(&[("a", &[]), ("b", &[])], FailurePolicy::ContinueSkippingDependents);
        force(&mut p, 0, &RUN);
        force(&mut p, 0, &[StepStatus::Failed(FailureKind::NonZeroExit { code: 1 })]);
        force(&mut p, 1, &RUN);
        force(&mut p, 1, &[StepStatus::Succeeded]);
        assert_eq!(p.status(), PlanStatus::CompletedWithFailures);
    }

    #[test]
    fn test_status_failed_when_dependent_skipped() {
        let mut p = plan(&[("a", &[]), ("b", &[1])], FailurePolicy::ContinueSkippingDependents);
        force(&mut p, 0, &RUN);
        force(&mut p, 0, &[StepStatus::Failed(FailureKind::NonZeroExit { code: 1 })]);
        force(&mut p, 1, &[StepStatus::Skipped]);
        assert_eq!(p.status(), PlanStatus::Failed);
    }

    #[test]
    fn test_status_cancelled_on_decline() {
        let mut p = plan(&[("a", &[])], FailurePolicy::AbortOnFailure);
        force(&mut p, 0, &[StepStatus::Classified, StepStatus::AwaitingConfirmation, StepStatus::Cancelled]);
        assert_eq!(p.status(), PlanStatus::Cancelled);
    }

    #[test]
    fn test_failed_rollback_reported_first() {
        let mut p = plan(&[("a", &[]), ("b", &[])], FailurePolicy::AbortOnFailure);
        force(&mut p, 0, &RUN);
        force(&mut p, 0, &[StepStatus::Succeeded]);
        force(&mut p, 1, &[StepStatus::Cancelled]);
        p.cancelled = true;
        let report = PlanReport::from_plan(&p, vec![RollbackRecord::failed(StepId(1), "busy")]);
        assert!(report.degraded());
        match report.into_result() {
            Err(ShellgateError::RollbackFailure { step_id, reason }) => {
                assert_eq!(step_id, StepId(1).to_string());
                assert_eq!(reason, "busy");
            }
            other => panic!("expected rollback failure, got {other:?}"),
        }
    }

    #[test]
    fn test_irreversible_leftovers_degrade_the_report() {
        let mut p = plan(&[("a", &[]), ("b", &[])], FailurePolicy::AbortOnFailure);
        force(&mut p, 0, &RUN);
        force(&mut p, 0, &[StepStatus::Succeeded]);
        force(&mut p, 1, &RUN);
        force(&mut p, 1, &[StepStatus::Failed(FailureKind::NonZeroExit { code: 1 })]);
        let partial = RollbackRecord {
            step_id: StepId(1),
            actions: Vec::new(),
            applied: 0,
            irreversible: vec!["removed /srv/gone.txt".to_string()],
            error: None,
        };
        assert!(partial.succeeded());
        assert!(!partial.restored());

        let report = PlanReport::from_plan(&p, vec![partial]);
        assert!(report.degraded());
        match report.into_result() {
            Err(ShellgateError::RollbackFailure { step_id, reason }) => {
                assert_eq!(step_id, StepId(1).to_string());
                assert!(reason.contains("1 irreversible"), "{reason}");
            }
            other => panic!("expected rollback failure, got {other:?}"),
        }
    }
}
