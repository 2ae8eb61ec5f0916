//! Risk levels, sandbox modes and the classifier's verdict.

use serde::{Deserialize, Serialize};

/// Danger level assigned to an operation.
///
/// Ordered: `Benign < Moderate < Destructive < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Read-only or otherwise harmless.
    Benign,
    /// Mutates state in a way that is usually reversible.
    Moderate,
    /// Removes data, kills processes or reaches unknown hosts.
    Destructive,
    /// Potentially unrecoverable; always requires explicit confirmation.
    Critical,
}

impl RiskLevel {
    /// Weakest sandbox mode an operation at this level may run under.
    pub fn minimum_mode(self) -> SandboxMode {
        match self {
            Self::Benign => SandboxMode::DryRun,
            Self::Moderate => SandboxMode::Simulation,
            Self::Destructive => SandboxMode::Isolated,
            Self::Critical => SandboxMode::Validation,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Benign => write!(f, "benign"),
            Self::Moderate => write!(f, "moderate"),
            Self::Destructive => write!(f, "destructive"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Isolation mode used to execute a step.
///
/// Totally ordered by strictness: `DryRun <= Simulation <= Isolated <= Validation`.
/// A mode attached to a step is a floor; it may be escalated but never lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Parse and predict only. Nothing is executed.
    DryRun,
    /// Execute against a disposable overlay copy of the touched paths.
    Simulation,
    /// Execute on the real system with reduced privilege and a time budget.
    Isolated,
    /// Full execution after confirmation and a successful preflight.
    Validation,
}

impl SandboxMode {
    /// Whether this mode runs against the real system.
    pub fn touches_real_system(self) -> bool {
        matches!(self, Self::Isolated | Self::Validation)
    }
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DryRun => write!(f, "dry_run"),
            Self::Simulation => write!(f, "simulation"),
            Self::Isolated => write!(f, "isolated"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

impl std::str::FromStr for SandboxMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "dry_run" | "dryrun" => Ok(Self::DryRun),
            "simulation" => Ok(Self::Simulation),
            "isolated" => Ok(Self::Isolated),
            "validation" => Ok(Self::Validation),
            other => Err(format!("unknown sandbox mode: {other}")),
        }
    }
}

/// A rule that matched during classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchedRule {
    /// Stable rule identifier, e.g. `recursive-delete-outside-scratch`.
    pub rule_id: String,
    /// Human-readable explanation.
    pub description: String,
    /// Level the rule assigns.
    pub level: RiskLevel,
}

impl std::fmt::Display for MatchedRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} ({})", self.level, self.description, self.rule_id)
    }
}

/// The classifier's verdict on an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub level: RiskLevel,
    /// Every rule that matched, in rule declaration order.
    pub reasons: Vec<MatchedRule>,
    /// Minimum mode the operation may execute under.
    pub required_mode: SandboxMode,
    /// Rule that decided the level, if any.
    pub decisive_rule: Option<String>,
    /// `true` when no rule or safe pattern matched and the profile failed closed.
    #[serde(default)]
    pub ambiguous: bool,
}

impl RiskProfile {
    /// Fail-closed profile for an operation that could not be classified.
    pub fn fail_closed(reason: impl Into<String>) -> Self {
        Self {
            level: RiskLevel::Critical,
            reasons: vec![MatchedRule {
                rule_id: "classification-ambiguous".to_string(),
                description: reason.into(),
                level: RiskLevel::Critical,
            }],
            required_mode: SandboxMode::Validation,
            decisive_rule: None,
            ambiguous: true,
        }
    }

    /// Whether the orchestrator must block for explicit user confirmation.
    pub fn requires_confirmation(&self) -> bool {
        self.required_mode >= SandboxMode::Validation || self.level == RiskLevel::Critical
    }

    /// Reason descriptions, in order.
    pub fn reason_texts(&self) -> Vec<String> {
        self.reasons.iter().map(|r| r.description.clone()).collect()
    }
}

impl std::fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (requires {})", self.level, self.required_mode)
    }
}
