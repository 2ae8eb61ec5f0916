//! Plan orchestration.
//!
//! - [`engine`] - `Orchestrator::run_plan()`
//! - [`confirm`] - `ConfirmationChannel` and the scripted fake
//! - [`rollback`] - inverse actions for reversible diffs

pub mod confirm;
pub mod engine;
pub mod rollback;

pub use confirm::{ConfirmationChannel, ConfirmationRequest, ScriptedConfirmer};
pub use engine::Orchestrator;
pub use rollback::{InverseAction, RollbackPlan, RollbackRecord};
