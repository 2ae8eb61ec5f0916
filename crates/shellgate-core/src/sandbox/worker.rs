//! Typed request/reply channel between the orchestrator and the executor.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::error::SandboxError;
use super::executor::{ExecRequest, SandboxExecutor};
use crate::cancel::CancelSignal;
use crate::domain::{ExecutionOutcome, StepFailure};

struct Job {
    request: ExecRequest,
    cancel: CancelSignal,
    reply: oneshot::Sender<ExecutionOutcome>,
}

/// Sending side held by orchestrators. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    tx: mpsc::Sender<Job>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("step", &self.request.step_id).finish()
    }
}

/// Start the executor loop. Each job runs on its own task so independent
/// plans do not queue behind each other.
pub fn spawn_executor(executor: SandboxExecutor, capacity: usize) -> (ExecutorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
    let executor = Arc::new(executor);
    let task = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                let step = job.request.step_id;
                let outcome = executor.execute(&job.request, &job.cancel).await;
                if job.reply.send(outcome).is_err() {
                    debug!(%step, "requester went away before the reply");
                }
            });
        }
        debug!("executor channel closed");
    });
    (ExecutorHandle { tx }, task)
}

impl ExecutorHandle {
    /// Submit a request and wait for its outcome. A dead worker is reported
    /// as a setup failure.
    pub async fn execute(&self, request: ExecRequest, cancel: CancelSignal) -> ExecutionOutcome {
        let mode = request.mode;
        let profile = request.profile.clone();
        let gone = || {
            let err = SandboxError::WorkerGone;
            error!(error = %err, "executor unavailable");
            ExecutionOutcome::Failed {
                failure: StepFailure::new(err.failure_kind(), mode, Some(&profile), err.to_string()),
                partial: None,
            }
        };

        let (reply, rx) = oneshot::channel();
        let job = Job {
            request,
            cancel,
            reply,
        };
        if self.tx.send(job).await.is_err() {
            return gone();
        }
        // A panicking job drops its reply sender.
        rx.await.unwrap_or_else(|_| gone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, Operation, RiskLevel, RiskProfile, SandboxMode, StepId};
    use crate::policy::PolicyContext;

    fn request(raw: &str) -> ExecRequest {
        let profile = RiskProfile {
            level: RiskLevel::Benign,
            reasons: Vec::new(),
            required_mode: SandboxMode::DryRun,
            decisive_rule: None,
            ambiguous: false,
        };
        ExecRequest::new(StepId(1), Operation::new(raw, None, "/"), profile, SandboxMode::DryRun)
    }

    #[tokio::test]
    async fn test_round_trip_through_worker() {
        let executor = SandboxExecutor::from_policy(Arc::new(PolicyContext::default()));
        let (handle, _task) = spawn_executor(executor, 4);
        let outcome = handle.execute(request("ls"), CancelSignal::never()).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_dead_worker_is_setup_failure() {
        let executor = SandboxExecutor::from_policy(Arc::new(PolicyContext::default()));
        let (handle, task) = spawn_executor(executor, 1);
        task.abort();
        let _ = task.await;
        let outcome = handle.execute(request("ls"), CancelSignal::never()).await;
        assert_eq!(
            outcome.failure().unwrap().kind,
            FailureKind::SandboxSetupFailure
        );
    }
}
