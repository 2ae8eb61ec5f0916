//! Plan orchestrator: classify, confirm, execute, record, and apply the
//! failure policy, one step at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::confirm::{self, ConfirmationChannel, ConfirmationRequest};
use super::rollback::{RollbackPlan, RollbackRecord};
use crate::audit::{AuditEntry, AuditLog, AuditOutcome, AuditRecord};
use crate::cancel::CancelSignal;
use crate::classifier::Classifier;
use crate::domain::{
    ConfirmationDecision, ConfirmationRecord, ExecutionOutcome, ExecutionResult, FailureKind,
    FailurePolicy, Plan, PlanReport, PlanSubmission, PreflightRecord, Result, SandboxMode, Step,
    StepFailure, StepId, StepStatus,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::policy::PolicyContext;
use crate::sandbox::{spawn_executor, ExecRequest, ExecutorHandle, SandboxExecutor};

/// Queue depth of the executor channel built by the convenience constructors.
const EXECUTOR_QUEUE: usize = 16;

/// How a step ended, from the plan's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepEnd {
    Succeeded,
    Failed,
    Declined,
    /// The plan's cancel signal fired while the step was in flight.
    PlanCancelled,
}

#[derive(Debug, Default)]
struct RunState {
    /// Steps to skip, with the cause.
    skip: BTreeMap<StepId, String>,
    /// Set by an abort under `AbortOnFailure`.
    aborted: Option<String>,
    /// An approve-all-remaining decision was given.
    blanket: bool,
}

/// Drives plans through classification, confirmation and execution.
///
/// Steps of one plan run strictly in order. Several plans may run on the
/// same orchestrator concurrently; they share the executor and its locks.
pub struct Orchestrator {
    policy: Arc<PolicyContext>,
    classifier: Classifier,
    executor: ExecutorHandle,
    audit: Arc<dyn AuditLog>,
}

impl Orchestrator {
    pub fn new(
        policy: Arc<PolicyContext>,
        classifier: Classifier,
        executor: ExecutorHandle,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            policy,
            classifier,
            executor,
            audit,
        }
    }

    /// Spawn a worker for `executor`. Needs a running Tokio runtime.
    pub fn with_executor(
        policy: Arc<PolicyContext>,
        executor: SandboxExecutor,
        audit: Arc<dyn AuditLog>,
    ) -> Result<Self> {
        let classifier = Classifier::from_policy(Arc::clone(&policy))?;
        let (handle, _worker) = spawn_executor(executor, EXECUTOR_QUEUE);
        Ok(Self::new(policy, classifier, handle, audit))
    }

    /// Host-backed executor. Needs a running Tokio runtime.
    pub fn from_policy(policy: Arc<PolicyContext>, audit: Arc<dyn AuditLog>) -> Result<Self> {
        let executor = SandboxExecutor::from_policy(Arc::clone(&policy));
        Self::with_executor(policy, executor, audit)
    }

    pub fn policy(&self) -> &PolicyContext {
        &self.policy
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Validate a submission into a plan without running anything.
    pub fn prepare(&self, submission: PlanSubmission) -> Result<Plan> {
        let cwd = match &self.policy.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        Plan::from_submission(submission, self.policy.default_mode_floor, &cwd)
    }

    pub async fn run_plan(
        &self,
        submission: PlanSubmission,
        confirmer: &dyn ConfirmationChannel,
        cancel: CancelSignal,
    ) -> Result<PlanReport> {
        let plan = self.prepare(submission)?;
        self.run(plan, confirmer, cancel).await
    }

    /// Run a prepared plan to completion, cancellation or abort.
    ///
    /// Step failures are reported in the returned `PlanReport`; `Err` is
    /// reserved for an audit log that cannot be written, which stops the
    /// plan before the next step runs.
    pub async fn run(
        &self,
        mut plan: Plan,
        confirmer: &dyn ConfirmationChannel,
        cancel: CancelSignal,
    ) -> Result<PlanReport> {
        let span = obs::plan_span(&plan.id.to_string());
        self.drive(&mut plan, confirmer, &cancel).instrument(span).await
    }

    async fn drive(
        &self,
        plan: &mut Plan,
        confirmer: &dyn ConfirmationChannel,
        cancel: &CancelSignal,
    ) -> Result<PlanReport> {
        let started = Instant::now();
        let plan_id = plan.id.to_string();
        obs::emit_plan_started(&plan_id, plan.steps.len(), plan.mode_floor);

        let mut run = RunState::default();
        for index in 0..plan.steps.len() {
            let id = plan.steps[index].id;
            if cancel.is_cancelled() {
                plan.cancelled = true;
            }
            if plan.cancelled {
                self.settle(plan, index, StepStatus::Cancelled, "plan cancelled").await?;
                continue;
            }
            if let Some(cause) = run.aborted.clone() {
                self.settle(plan, index, StepStatus::Skipped, &cause).await?;
                continue;
            }
            if let Some(cause) = run.skip.get(&id).cloned() {
                self.settle(plan, index, StepStatus::Skipped, &cause).await?;
                continue;
            }

            match self.run_step(plan, index, confirmer, cancel, &mut run).await? {
                StepEnd::Succeeded => {}
                StepEnd::PlanCancelled => plan.cancelled = true,
                StepEnd::Failed | StepEnd::Declined => match plan.failure_policy {
                    FailurePolicy::AbortOnFailure => {
                        run.aborted = Some(format!("plan aborted after {id}"));
                    }
                    FailurePolicy::ContinueSkippingDependents => {
                        for dependent in plan.dependents_of(id) {
                            run.skip
                                .entry(dependent)
                                .or_insert_with(|| format!("depends on {id}"));
                        }
                    }
                },
            }
        }

        let roll_back = plan.cancelled || (run.aborted.is_some() && self.policy.rollback_on_abort);
        let rollbacks = if roll_back {
            self.roll_back(plan).await?
        } else {
            Vec::new()
        };

        let report = PlanReport::from_plan(plan, rollbacks);
        obs::emit_plan_finished(
            &plan_id,
            &report.status.to_string(),
            started.elapsed().as_millis() as u64,
            report.degraded(),
        );
        METRICS.flush();
        Ok(report)
    }

    async fn run_step(
        &self,
        plan: &mut Plan,
        index: usize,
        confirmer: &dyn ConfirmationChannel,
        cancel: &CancelSignal,
        run: &mut RunState,
    ) -> Result<StepEnd> {
        let plan_id = plan.id;
        let floor = plan.mode_floor;
        let step = &mut plan.steps[index];
        let id = step.id;

        let profile = self.classifier.classify(&step.operation);
        METRICS.inc_classified();
        let mode = profile.required_mode.max(floor);
        step.risk_profile = Some(profile.clone());
        step.transition(StepStatus::Classified)?;
        self.record(AuditRecord::for_step(plan_id, step, AuditOutcome::Classified).with_mode(mode))
            .await?;
        obs::emit_step_classified(id, &profile, mode);

        if profile.requires_confirmation() || mode >= SandboxMode::Validation {
            let record = if run.blanket {
                debug!(step = %id, "covered by approve-all-remaining");
                ConfirmationRecord::new(id, ConfirmationDecision::ApproveAllRemaining, true, &step.operation)
            } else {
                step.transition(StepStatus::AwaitingConfirmation)?;
                obs::emit_confirmation_requested(id, &profile);
                METRICS.inc_confirmations();
                let request = ConfirmationRequest {
                    plan_id,
                    step_id: id,
                    risk_profile: profile.clone(),
                    operation_text: step.operation.raw().to_string(),
                    mode,
                };
                let decision =
                    confirm::ask(confirmer, &request, self.policy.confirmation_timeout(), cancel).await;
                if !decision.is_approval() {
                    METRICS.inc_declines();
                    let plan_cancelled = cancel.is_cancelled();
                    let (kind, message) = if plan_cancelled {
                        (FailureKind::Cancelled, "plan cancelled while awaiting confirmation")
                    } else {
                        (FailureKind::ConfirmationDeclined, "confirmation declined")
                    };
                    step.failure = Some(StepFailure::new(kind, mode, Some(&profile), message));
                    step.transition(StepStatus::Cancelled)?;
                    self.record(AuditRecord::for_step(plan_id, step, AuditOutcome::Cancelled)).await?;
                    obs::emit_step_finished(id, step.status(), mode, 0);
                    return Ok(if plan_cancelled {
                        StepEnd::PlanCancelled
                    } else {
                        StepEnd::Declined
                    });
                }
                if decision == ConfirmationDecision::ApproveAllRemaining {
                    info!(step = %id, "approve-all-remaining granted");
                    run.blanket = true;
                }
                ConfirmationRecord::new(id, decision, false, &step.operation)
            };
            step.confirmation = Some(record);
        }
        step.transition(StepStatus::Approved)?;

        if mode == SandboxMode::Validation && step.operation.preflight_available() {
            let mut preflight_profile = profile.clone();
            preflight_profile.required_mode = SandboxMode::Simulation;
            let mut request = ExecRequest::new(
                id,
                step.operation.clone(),
                preflight_profile,
                SandboxMode::Simulation,
            );
            if let Some(record) = &step.confirmation {
                request = request.with_confirmation(record.clone());
            }
            info!(step = %id, "running preflight simulation");
            let outcome = self.executor.execute(request, cancel.clone()).await;
            step.preflight = Some(PreflightRecord {
                step_id: id,
                mode: SandboxMode::Simulation,
                succeeded: outcome.is_success(),
                operation_digest: step.operation.digest(),
                diff_summary: outcome
                    .result()
                    .map(|r| r.state_diff.summary())
                    .unwrap_or_default(),
            });
            if let ExecutionOutcome::Failed { mut failure, partial } = outcome {
                failure.message = format!("preflight: {}", failure.message);
                return self
                    .fail(plan_id, step, failure, partial, SandboxMode::Simulation)
                    .await;
            }
        }

        step.mode_used = Some(mode);
        self.record(AuditRecord::for_step(plan_id, step, AuditOutcome::Started)).await?;
        step.transition(StepStatus::Running)?;

        let mut request = ExecRequest::new(id, step.operation.clone(), profile, mode);
        if let Some(record) = &step.confirmation {
            request = request.with_confirmation(record.clone());
        }
        if let Some(record) = &step.preflight {
            request = request.with_preflight(record.clone());
        }
        METRICS.inc_executed();
        match self.executor.execute(request, cancel.clone()).await {
            ExecutionOutcome::Completed(result) => {
                let duration_ms = result.duration_ms;
                step.result = Some(result);
                step.transition(StepStatus::Succeeded)?;
                self.record(AuditRecord::for_step(plan_id, step, AuditOutcome::Succeeded)).await?;
                obs::emit_step_finished(id, step.status(), mode, duration_ms);
                Ok(StepEnd::Succeeded)
            }
            ExecutionOutcome::Failed { failure, partial } => {
                self.fail(plan_id, step, failure, partial, mode).await
            }
        }
    }

    async fn fail(
        &self,
        plan_id: Uuid,
        step: &mut Step,
        failure: StepFailure,
        partial: Option<ExecutionResult>,
        mode: SandboxMode,
    ) -> Result<StepEnd> {
        METRICS.inc_failed();
        let kind = failure.kind;
        let duration_ms = partial.as_ref().map(|r| r.duration_ms).unwrap_or(0);
        warn!(step = %step.id, %failure, "step failed");
        step.mode_used = Some(mode);
        step.result = partial;
        step.failure = Some(failure);
        step.transition(StepStatus::Failed(kind))?;
        self.record(AuditRecord::for_step(plan_id, step, AuditOutcome::Failed)).await?;
        obs::emit_step_finished(step.id, step.status(), mode, duration_ms);
        Ok(if kind == FailureKind::Cancelled {
            StepEnd::PlanCancelled
        } else {
            StepEnd::Failed
        })
    }

    /// Finish a step that will not run.
    async fn settle(&self, plan: &mut Plan, index: usize, status: StepStatus, cause: &str) -> Result<()> {
        let plan_id = plan.id;
        let step = &mut plan.steps[index];
        step.transition(status)?;
        let outcome = match status {
            StepStatus::Skipped => {
                obs::emit_step_skipped(step.id, cause);
                AuditOutcome::Skipped
            }
            _ => AuditOutcome::Cancelled,
        };
        self.record(AuditRecord::for_step(plan_id, step, outcome).with_message(cause))
            .await?;
        Ok(())
    }

    /// Undo succeeded real-system steps, newest first. Failures are recorded
    /// and never stop the remaining rollbacks.
    async fn roll_back(&self, plan: &Plan) -> Result<Vec<RollbackRecord>> {
        let mut records = Vec::new();
        for step in plan.steps.iter().rev() {
            if step.status() != StepStatus::Succeeded
                || !step.mode_used.is_some_and(SandboxMode::touches_real_system)
            {
                continue;
            }
            let Some(result) = &step.result else {
                continue;
            };
            let rollback_plan = RollbackPlan::from_diff(step.operation.category(), &result.state_diff);
            let id = step.id;
            let record = tokio::task::spawn_blocking(move || rollback_plan.apply(id))
                .await
                .unwrap_or_else(|e| RollbackRecord::failed(id, format!("rollback task failed: {e}")));

            METRICS.inc_rollbacks();
            obs::emit_rollback_applied(id, record.actions.len(), record.restored());
            let outcome = if !record.succeeded() {
                AuditOutcome::RollbackFailed
            } else if !record.irreversible.is_empty() {
                AuditOutcome::RolledBackPartially
            } else {
                AuditOutcome::RolledBack
            };
            self.record(AuditRecord::for_step(plan.id, step, outcome).with_message(record.summary()))
                .await?;
            records.push(record);
        }
        Ok(records)
    }

    async fn record(&self, record: AuditRecord) -> Result<AuditEntry> {
        Ok(self.audit.append(record).await?)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("mode_floor", &self.policy.default_mode_floor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::domain::{PlanStatus, StepSubmission};
    use crate::orchestrator::ScriptedConfirmer;

    fn orchestrator(policy: PolicyContext) -> (Orchestrator, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let orch = Orchestrator::from_policy(Arc::new(policy), audit.clone()).unwrap();
        (orch, audit)
    }

    #[tokio::test]
    async fn test_dry_run_floor_plan_succeeds_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("made.txt");
        let (orch, audit) = orchestrator(PolicyContext::default());
        let sub = PlanSubmission::new(vec![StepSubmission::new("ls")])
            .with_floor(SandboxMode::DryRun)
            .in_dir(dir.path());
        let report = orch
            .run_plan(sub, &ScriptedConfirmer::always(ConfirmationDecision::Decline), CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(report.status, PlanStatus::Succeeded);
        assert!(!target.exists());
        assert_eq!(
            audit.outcomes_for(StepId(1)),
            vec![AuditOutcome::Classified, AuditOutcome::Started, AuditOutcome::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_audit_failure_stops_plan() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, audit) = orchestrator(PolicyContext::default());
        audit.set_failing(true);
        let sub = PlanSubmission::new(vec![StepSubmission::new(format!(
            "touch {}/never.txt",
            dir.path().display()
        ))]);
        let err = orch
            .run_plan(sub, &ScriptedConfirmer::always(ConfirmationDecision::Approve), CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::domain::ShellgateError::Audit(_)));
        assert!(!dir.path().join("never.txt").exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_cancels_every_step() {
        let (orch, audit) = orchestrator(PolicyContext::default());
        let (handle, signal) = crate::cancel::cancel_pair();
        handle.cancel();
        let sub = PlanSubmission::new(vec![StepSubmission::new("ls"), StepSubmission::new("pwd")]);
        let report = orch
            .run_plan(sub, &ScriptedConfirmer::always(ConfirmationDecision::Approve), signal)
            .await
            .unwrap();
        assert_eq!(report.status, PlanStatus::Cancelled);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Cancelled));
        assert_eq!(audit.count(AuditOutcome::Cancelled), 2);
    }
}
