//! Runs one operation under a sandbox mode.
//!
//! | Mode         | Runs?          | Where                      | Budget                      |
//! |--------------|----------------|----------------------------|-----------------------------|
//! | `DryRun`     | no             | -                          | predicted diff only         |
//! | `Simulation` | yes            | disposable overlay         | simulation timeout, rlimits |
//! | `Isolated`   | yes            | real system, locked scopes | isolated timeout, rlimits   |
//! | `Validation` | yes            | real system, locked scopes | optional timeout            |
//!
//! Every run is bracketed by change-tracker snapshots. The executor re-checks
//! the mode floor, confirmation record and preflight record before running.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::error::SandboxError;
use super::lock::ResourceLocks;
use super::overlay::Overlay;
use super::process::{self, ProcessExit, ProcessOutput, ProcessSpec, ResourceLimits};
use crate::cancel::CancelSignal;
use crate::domain::{
    ConfirmationRecord, ExecutionOutcome, ExecutionResult, FailureKind, Operation,
    PreflightRecord, RiskProfile, SandboxMode, StepFailure, StepId,
};
use crate::policy::PolicyContext;
use crate::tracker::{self, ChangeTracker, HostProbe, ResourceSet, StateDiff};

/// Exit status `sh` uses when a command exists but cannot be executed.
const SH_NOT_EXECUTABLE: i32 = 126;

/// Everything the executor needs to run one step.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub step_id: StepId,
    pub operation: Operation,
    pub profile: RiskProfile,
    /// Effective mode, never weaker than `profile.required_mode`.
    pub mode: SandboxMode,
    pub confirmation: Option<ConfirmationRecord>,
    pub preflight: Option<PreflightRecord>,
}

impl ExecRequest {
    pub fn new(step_id: StepId, operation: Operation, profile: RiskProfile, mode: SandboxMode) -> Self {
        Self {
            step_id,
            operation,
            profile,
            mode,
            confirmation: None,
            preflight: None,
        }
    }

    pub fn with_confirmation(mut self, record: ConfirmationRecord) -> Self {
        self.confirmation = Some(record);
        self
    }

    pub fn with_preflight(mut self, record: PreflightRecord) -> Self {
        self.preflight = Some(record);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    policy: Arc<PolicyContext>,
    tracker: ChangeTracker,
    locks: ResourceLocks,
}

impl SandboxExecutor {
    pub fn new(policy: Arc<PolicyContext>, tracker: ChangeTracker, locks: ResourceLocks) -> Self {
        Self {
            policy,
            tracker,
            locks,
        }
    }

    /// Host probe and the process-wide lock table.
    pub fn from_policy(policy: Arc<PolicyContext>) -> Self {
        let tracker = ChangeTracker::from_policy(&policy, Arc::new(HostProbe));
        let locks = ResourceLocks::shared(policy.lock_depth);
        Self::new(policy, tracker, locks)
    }

    pub fn policy(&self) -> &PolicyContext {
        &self.policy
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    /// Run `req` and report what happened. Never panics on subprocess failure
    /// and never retries.
    pub async fn execute(&self, req: &ExecRequest, cancel: &CancelSignal) -> ExecutionOutcome {
        if let Err(failure) = self.check_clearance(req) {
            warn!(step = %req.step_id, mode = %req.mode, reason = %failure.message, "execution refused");
            return ExecutionOutcome::Failed {
                failure,
                partial: None,
            };
        }
        if cancel.is_cancelled() {
            return self.failed(req, FailureKind::Cancelled, "cancelled before start", None);
        }

        info!(step = %req.step_id, mode = %req.mode, operation = %req.operation, "executing");
        match req.mode {
            SandboxMode::DryRun => self.dry_run(req),
            SandboxMode::Simulation => self.simulate(req, cancel).await,
            SandboxMode::Isolated | SandboxMode::Validation => self.run_real(req, cancel).await,
        }
    }

    fn check_clearance(&self, req: &ExecRequest) -> Result<(), StepFailure> {
        let deny = |msg: String| {
            StepFailure::new(
                FailureKind::PermissionDenied,
                req.mode,
                Some(&req.profile),
                msg,
            )
        };
        if req.mode < req.profile.required_mode {
            return Err(deny(format!(
                "mode {} is weaker than required {}",
                req.mode, req.profile.required_mode
            )));
        }
        if req.mode == SandboxMode::DryRun {
            return Ok(());
        }
        let needs_confirmation =
            req.mode == SandboxMode::Validation || req.profile.requires_confirmation();
        let confirmed = req
            .confirmation
            .as_ref()
            .map(|c| c.approves(req.step_id, &req.operation))
            .unwrap_or(false);
        if needs_confirmation && !confirmed {
            return Err(deny(format!("{} has no matching confirmation record", req.step_id)));
        }
        if req.mode == SandboxMode::Validation && req.operation.preflight_available() {
            let cleared = req
                .preflight
                .as_ref()
                .map(|p| p.clears(req.step_id, &req.operation))
                .unwrap_or(false);
            if !cleared {
                return Err(deny(format!("{} has no successful preflight run", req.step_id)));
            }
        }
        Ok(())
    }

    fn dry_run(&self, req: &ExecRequest) -> ExecutionOutcome {
        if let Some(err) = req.operation.parse_error() {
            return self.failed(
                req,
                FailureKind::SandboxSetupFailure,
                format!("cannot parse operation: {err}"),
                None,
            );
        }
        let diff = tracker::predict(&req.operation);
        debug!(step = %req.step_id, diff = %diff.summary(), "dry run");
        ExecutionOutcome::Completed(ExecutionResult::predicted(diff))
    }

    async fn simulate(&self, req: &ExecRequest, cancel: &CancelSignal) -> ExecutionOutcome {
        let op = &req.operation;
        if !op.category().supports_overlay() || op.is_opaque() || op.parse_error().is_some() {
            let err = SandboxError::Unsupported {
                mode: SandboxMode::Simulation,
                category: op.category().to_string(),
            };
            return self.setup_failed(req, err);
        }

        let set = ResourceSet::scoped(op, None);
        let max_entries = self.policy.snapshot_max_entries;
        let prepared = {
            let op = op.clone();
            let set = set.clone();
            tokio::task::spawn_blocking(move || Overlay::prepare(&op, &set, max_entries)).await
        };
        let overlay = match prepared {
            Ok(Ok(overlay)) => overlay,
            Ok(Err(err)) => return self.setup_failed(req, err),
            Err(join) => return self.setup_failed(req, SandboxError::Overlay(join.to_string())),
        };

        let before = match self.tracker.snapshot_in(&set, Some(overlay.root())).await {
            Ok(snap) => snap,
            Err(err) => return self.setup_failed(req, err),
        };

        let script = match overlay.rewrite(op) {
            Ok(script) => script,
            Err(err) => return self.setup_failed(req, err),
        };
        let spec = ProcessSpec {
            script,
            cwd: overlay.physical(op.cwd()),
            env: overlay.env(),
            timeout: self.policy.timeout_for(SandboxMode::Simulation),
            grace: self.policy.cancel_grace(),
            max_output_bytes: self.policy.max_output_bytes,
            limits: Some(self.limits(SandboxMode::Simulation)),
        };
        let output = match process::run(&spec, cancel).await {
            Ok(output) => output,
            Err(err) => return self.setup_failed(req, err),
        };

        let diff = match self.tracker.snapshot_in(&set, Some(overlay.root())).await {
            Ok(after) => self.tracker.diff(&before, &after),
            Err(err) => {
                warn!(step = %req.step_id, error = %err, "post-run overlay snapshot failed");
                StateDiff::default()
            }
        };

        let discarded = tokio::task::spawn_blocking(move || overlay.discard()).await;
        if !matches!(discarded, Ok(Ok(()))) {
            warn!(step = %req.step_id, "overlay cleanup incomplete");
        }

        self.finish(req, output, diff, spec.timeout)
    }

    async fn run_real(&self, req: &ExecRequest, cancel: &CancelSignal) -> ExecutionOutcome {
        let op = &req.operation;
        let _guard = match self.locks.acquire(op, cancel).await {
            Ok(guard) => guard,
            Err(_) if cancel.is_cancelled() => {
                return self.failed(req, FailureKind::Cancelled, "cancelled waiting for lock", None)
            }
            Err(err) => return self.setup_failed(req, err),
        };

        let set = ResourceSet::scoped(op, None);
        let before = match self.tracker.snapshot(&set).await {
            Ok(snap) => snap,
            Err(err) => return self.setup_failed(req, err),
        };

        let timeout = self.policy.timeout_for(req.mode);
        let spec = ProcessSpec {
            script: op.normalized().to_string(),
            cwd: op.cwd().to_path_buf(),
            env: Vec::new(),
            timeout,
            grace: self.policy.cancel_grace(),
            max_output_bytes: self.policy.max_output_bytes,
            limits: (req.mode == SandboxMode::Isolated).then(|| self.limits(SandboxMode::Isolated)),
        };
        let output = match process::run(&spec, cancel).await {
            Ok(output) => output,
            Err(err) => return self.setup_failed(req, err),
        };

        // The process ran; a failed post-snapshot must not hide that.
        let diff = match self.tracker.snapshot(&set).await {
            Ok(after) => self.tracker.diff(&before, &after),
            Err(err) => {
                warn!(step = %req.step_id, error = %err, "post-run snapshot failed");
                StateDiff::default()
            }
        };
        self.finish(req, output, diff, timeout)
    }

    fn limits(&self, mode: SandboxMode) -> ResourceLimits {
        ResourceLimits {
            // CPU budget backs up the wall-clock timeout.
            cpu_secs: self.policy.timeout_for(mode).map(|t| t.as_secs() + 1),
            max_file_bytes: self.policy.isolated_max_file_bytes,
        }
    }

    fn finish(
        &self,
        req: &ExecRequest,
        output: ProcessOutput,
        diff: StateDiff,
        timeout: Option<Duration>,
    ) -> ExecutionOutcome {
        let exit_code = match output.exit {
            ProcessExit::Exited { code } => code,
            ProcessExit::TimedOut | ProcessExit::Cancelled => -1,
        };
        let result = ExecutionResult {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: output.duration_ms,
            state_diff: diff,
            mode: req.mode,
            output_truncated: output.truncated,
        };
        debug!(
            step = %req.step_id,
            exit_code,
            duration_ms = result.duration_ms,
            diff = %result.state_diff.summary(),
            "execution finished"
        );

        match output.exit {
            ProcessExit::Exited { code: 0 } => ExecutionOutcome::Completed(result),
            ProcessExit::Exited { code: SH_NOT_EXECUTABLE } => self.failed(
                req,
                FailureKind::PermissionDenied,
                "command could not be executed",
                Some(result),
            ),
            ProcessExit::Exited { code } => self.failed(
                req,
                FailureKind::NonZeroExit { code },
                format!("exited with status {code}"),
                Some(result),
            ),
            ProcessExit::TimedOut => {
                let limit_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                self.failed(
                    req,
                    FailureKind::Timeout { limit_ms },
                    format!("terminated after {limit_ms}ms"),
                    Some(result),
                )
            }
            ProcessExit::Cancelled => self.failed(
                req,
                FailureKind::Cancelled,
                "terminated on cancellation",
                Some(result),
            ),
        }
    }

    fn setup_failed(&self, req: &ExecRequest, err: SandboxError) -> ExecutionOutcome {
        warn!(step = %req.step_id, mode = %req.mode, error = %err, "sandbox setup failed");
        self.failed(req, err.failure_kind(), err.to_string(), None)
    }

    fn failed(
        &self,
        req: &ExecRequest,
        kind: FailureKind,
        message: impl Into<String>,
        partial: Option<ExecutionResult>,
    ) -> ExecutionOutcome {
        ExecutionOutcome::Failed {
            failure: StepFailure::new(kind, req.mode, Some(&req.profile), message),
            partial,
        }
    }
}
