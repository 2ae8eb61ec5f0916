//! Risk classifier.
//!
//! - [`rule`] - `RiskRule`, `RuleMatcher`, `RuleSet::standard()`
//! - [`engine`] - `Classifier::classify()` (highest severity, then declaration order; fail closed)

pub mod engine;
pub mod rule;

pub use engine::Classifier;
pub use rule::{RiskRule, RuleMatcher, RuleSet, ScratchScope};
