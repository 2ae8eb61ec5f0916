//! Structured lifecycle events for plans and steps.
//!
//! - `PlanSpan` RAII guard tagging everything inside with `plan_id`
//! - `emit_*` functions for plan, step and rollback events
//!
//! Events are emitted at `info!` (`warn!` for failures); filter with
//! `SHELLGATE_LOG`.

use tracing::{info, warn};

use crate::domain::{RiskProfile, SandboxMode, StepId, StepStatus};

/// Enters a plan-scoped span for as long as it lives.
///
/// Holds an `EnteredSpan`, so it must not be kept across `.await`; async
/// callers use [`plan_span`] with `Instrument` instead.
pub struct PlanSpan {
    _span: tracing::span::EnteredSpan,
}

impl PlanSpan {
    pub fn enter(plan_id: &str) -> Self {
        Self {
            _span: plan_span(plan_id).entered(),
        }
    }
}

pub fn plan_span(plan_id: &str) -> tracing::Span {
    tracing::info_span!("shellgate.plan", plan_id = %plan_id)
}

pub fn emit_plan_started(plan_id: &str, steps: usize, floor: SandboxMode) {
    info!(event = "plan.started", plan_id = %plan_id, steps = steps, mode_floor = %floor);
}

pub fn emit_step_classified(step: StepId, profile: &RiskProfile, effective: SandboxMode) {
    info!(
        event = "step.classified",
        step = %step,
        level = %profile.level,
        required_mode = %profile.required_mode,
        effective_mode = %effective,
        rule = profile.decisive_rule.as_deref().unwrap_or("-"),
        ambiguous = profile.ambiguous,
    );
}

pub fn emit_confirmation_requested(step: StepId, profile: &RiskProfile) {
    info!(event = "step.confirmation_requested", step = %step, level = %profile.level);
}

pub fn emit_step_finished(step: StepId, status: StepStatus, mode: SandboxMode, duration_ms: u64) {
    if matches!(status, StepStatus::Succeeded) {
        info!(event = "step.finished", step = %step, status = %status, mode = %mode, duration_ms);
    } else {
        warn!(event = "step.finished", step = %step, status = %status, mode = %mode, duration_ms);
    }
}

pub fn emit_step_skipped(step: StepId, cause: &str) {
    info!(event = "step.skipped", step = %step, cause = %cause);
}

pub fn emit_rollback_applied(step: StepId, actions: usize, ok: bool) {
    if ok {
        info!(event = "rollback.applied", step = %step, actions, ok);
    } else {
        warn!(event = "rollback.applied", step = %step, actions, ok);
    }
}

pub fn emit_plan_finished(plan_id: &str, status: &str, duration_ms: u64, degraded: bool) {
    info!(
        event = "plan.finished",
        plan_id = %plan_id,
        status = %status,
        duration_ms = duration_ms,
        degraded = degraded,
    );
}
