//! Confirmation channel between the orchestrator and the user.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::domain::{ConfirmationDecision, RiskProfile, SandboxMode, StepId};

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub plan_id: Uuid,
    pub step_id: StepId,
    pub risk_profile: RiskProfile,
    pub operation_text: String,
    /// Mode the step will run under if approved.
    pub mode: SandboxMode,
}

#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    async fn request_confirmation(&self, request: &ConfirmationRequest) -> ConfirmationDecision;
}

/// Ask `channel`, declining on timeout or cancellation.
pub(crate) async fn ask(
    channel: &dyn ConfirmationChannel,
    request: &ConfirmationRequest,
    timeout: Duration,
    cancel: &CancelSignal,
) -> ConfirmationDecision {
    tokio::select! {
        decision = tokio::time::timeout(timeout, channel.request_confirmation(request)) => {
            decision.unwrap_or_else(|_| {
                warn!(step = %request.step_id, timeout_ms = timeout.as_millis() as u64, "confirmation timed out");
                ConfirmationDecision::Decline
            })
        }
        _ = cancel.cancelled() => {
            debug!(step = %request.step_id, "confirmation abandoned on cancel");
            ConfirmationDecision::Decline
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedConfirmer
// ---------------------------------------------------------------------------

/// Answers from a script, then a fallback. Records what it was asked.
#[derive(Debug)]
pub struct ScriptedConfirmer {
    script: Mutex<VecDeque<ConfirmationDecision>>,
    fallback: ConfirmationDecision,
    delay: Option<Duration>,
    asked: Mutex<Vec<StepId>>,
}

impl ScriptedConfirmer {
    pub fn new(script: impl IntoIterator<Item = ConfirmationDecision>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: ConfirmationDecision::Decline,
            delay: None,
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn always(decision: ConfirmationDecision) -> Self {
        Self::new([]).with_fallback(decision)
    }

    pub fn with_fallback(mut self, decision: ConfirmationDecision) -> Self {
        self.fallback = decision;
        self
    }

    /// Wait this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn asked(&self) -> Vec<StepId> {
        self.asked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ConfirmationChannel for ScriptedConfirmer {
    async fn request_confirmation(&self, request: &ConfirmationRequest) -> ConfirmationDecision {
        self.asked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.step_id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(self.fallback)
    }
}
