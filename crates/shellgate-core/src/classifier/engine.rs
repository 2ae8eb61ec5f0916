//! Classification engine: highest severity wins, declaration order breaks ties,
//! anything unmatched fails closed.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use super::rule::{RiskRule, RuleMatcher, RuleSet};
use crate::domain::{
    MatchedRule, Operation, OperationCategory, Result, RiskLevel, RiskProfile, SandboxMode,
    ShellgateError,
};
use crate::policy::PolicyContext;

const SAFE_RULE_ID: &str = "safe-read-only";

struct CompiledRule {
    rule: RiskRule,
    regex: Option<Regex>,
}

/// Pure, deterministic classifier over a fixed rule set and policy.
pub struct Classifier {
    rules: Vec<CompiledRule>,
    safe_programs: HashSet<String>,
    policy: Arc<PolicyContext>,
}

impl Classifier {
    /// Compile `rules`. Fails if a pattern is not a valid regex.
    pub fn new(rules: RuleSet, policy: Arc<PolicyContext>) -> Result<Self> {
        let compiled = rules
            .rules
            .into_iter()
            .map(|rule| {
                let regex = match &rule.matcher {
                    RuleMatcher::Pattern { regex } => Some(Regex::new(regex).map_err(|e| {
                        ShellgateError::InvalidPolicy(format!("rule {}: {e}", rule.id))
                    })?),
                    _ => None,
                };
                Ok(CompiledRule { rule, regex })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules: compiled,
            safe_programs: rules.safe_programs.into_iter().collect(),
            policy,
        })
    }

    /// Use the policy's rule set, or the standard one.
    pub fn from_policy(policy: Arc<PolicyContext>) -> Result<Self> {
        let rules = policy.rules.clone().unwrap_or_else(RuleSet::standard);
        Self::new(rules, policy)
    }

    pub fn policy(&self) -> &PolicyContext {
        &self.policy
    }

    /// Classify an operation. Never touches the system.
    pub fn classify(&self, op: &Operation) -> RiskProfile {
        if let Some(err) = op.parse_error() {
            return RiskProfile::fail_closed(format!("could not parse operation: {err}"));
        }

        let matched: Vec<&RiskRule> = self
            .rules
            .iter()
            .filter(|c| c.rule.matcher.matches(op, &self.policy, c.regex.as_ref()))
            .map(|c| &c.rule)
            .collect();

        let Some(top) = matched.iter().map(|r| r.level).max() else {
            return if self.is_safe(op) {
                RiskProfile {
                    level: RiskLevel::Benign,
                    reasons: vec![MatchedRule {
                        rule_id: SAFE_RULE_ID.to_string(),
                        description: "read-only programs only".to_string(),
                        level: RiskLevel::Benign,
                    }],
                    required_mode: SandboxMode::DryRun,
                    decisive_rule: Some(SAFE_RULE_ID.to_string()),
                    ambiguous: false,
                }
            } else {
                RiskProfile::fail_closed("no rule or safe pattern matched")
            };
        };

        // First rule at the top level, in declaration order.
        let winner = matched
            .iter()
            .find(|r| r.level == top)
            .copied()
            .unwrap_or(matched[0]);

        let mut required_mode = winner.required_mode.max(top.minimum_mode());
        if required_mode == SandboxMode::Simulation && !op.category().supports_overlay() {
            required_mode = SandboxMode::Isolated;
        }

        let profile = RiskProfile {
            level: top,
            reasons: matched.iter().map(|r| r.to_matched()).collect(),
            required_mode,
            decisive_rule: Some(winner.id.clone()),
            ambiguous: false,
        };
        debug!(
            operation = %op,
            level = %profile.level,
            mode = %profile.required_mode,
            rule = %winner.id,
            "classified operation"
        );
        profile
    }

    /// Like [`classify`](Self::classify) but ambiguity is an error.
    pub fn classify_strict(&self, op: &Operation) -> Result<RiskProfile> {
        let profile = self.classify(op);
        if profile.ambiguous {
            return Err(ShellgateError::ClassificationAmbiguous(
                profile.reason_texts().join("; "),
            ));
        }
        Ok(profile)
    }

    fn is_safe(&self, op: &Operation) -> bool {
        op.category() == OperationCategory::ReadOnly
            && !op.commands().is_empty()
            && op.commands().iter().all(|c| {
                self.safe_programs.contains(&c.program)
                    && c.category == OperationCategory::ReadOnly
                    && c.redirect_writes.is_empty()
                    && !c.opaque
                    && !c.escalated
                    && !c.substitution
                    && !c.expansion
            })
    }
}
