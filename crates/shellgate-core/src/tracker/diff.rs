//! State diffs: observed (two snapshots) and predicted (from the operation).

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::snapshot::{EntryState, Snapshot};
use crate::domain::{CommandAction, Operation};

/// What changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ResourceRef {
    Path(PathBuf),
    Package(String),
    Process(String),
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Package(p) => write!(f, "package:{p}"),
            Self::Process(p) => write!(f, "process:{p}"),
        }
    }
}

/// How it changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Removed,
    Modified,
    /// Content now at this resource was removed from `from`.
    Moved { from: PathBuf },
}

/// One changed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub resource: ResourceRef,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<EntryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<EntryState>,
    /// Version or instance-count transition for packages and processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ResourceChange {
    fn path(kind: ChangeKind, path: PathBuf, before: Option<EntryState>, after: Option<EntryState>) -> Self {
        Self {
            resource: ResourceRef::Path(path),
            kind,
            before,
            after,
            detail: None,
        }
    }
}

impl std::fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ChangeKind::Created => write!(f, "+ {}", self.resource)?,
            ChangeKind::Removed => write!(f, "- {}", self.resource)?,
            ChangeKind::Modified => write!(f, "~ {}", self.resource)?,
            ChangeKind::Moved { from } => write!(f, "> {} -> {}", from.display(), self.resource)?,
        }
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// Before/after comparison of the resources an operation declared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDiff {
    pub changes: Vec<ResourceChange>,
    /// Derived from the operation text; nothing was observed.
    #[serde(default)]
    pub predicted: bool,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Observed changes only; a predicted diff never counts.
    pub fn observed_changes(&self) -> &[ResourceChange] {
        if self.predicted {
            &[]
        } else {
            &self.changes
        }
    }

    /// One-line summary, e.g. `2 created, 1 moved`.
    pub fn summary(&self) -> String {
        if self.changes.is_empty() {
            return if self.predicted {
                "no predicted changes".to_string()
            } else {
                "no changes".to_string()
            };
        }
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for change in &self.changes {
            let key = match change.kind {
                ChangeKind::Created => "created",
                ChangeKind::Removed => "removed",
                ChangeKind::Modified => "modified",
                ChangeKind::Moved { .. } => "moved",
            };
            *counts.entry(key).or_default() += 1;
        }
        let parts: Vec<String> = ["created", "removed", "modified", "moved"]
            .iter()
            .filter_map(|k| counts.get(k).map(|n| format!("{n} {k}")))
            .collect();
        let summary = parts.join(", ");
        if self.predicted {
            format!("predicted: {summary}")
        } else {
            summary
        }
    }
}

/// Compare two snapshots. A removed file and a created file with the same
/// content digest are reported as one move.
pub fn diff(before: &Snapshot, after: &Snapshot) -> StateDiff {
    let mut created: Vec<(PathBuf, EntryState)> = Vec::new();
    let mut removed: Vec<(PathBuf, EntryState)> = Vec::new();
    let mut changes: Vec<ResourceChange> = Vec::new();

    for (path, old) in &before.files {
        match after.files.get(path) {
            None => removed.push((path.clone(), old.clone())),
            Some(new) if new != old => changes.push(ResourceChange::path(
                ChangeKind::Modified,
                path.clone(),
                Some(old.clone()),
                Some(new.clone()),
            )),
            Some(_) => {}
        }
    }
    for (path, new) in &after.files {
        if !before.files.contains_key(path) {
            created.push((path.clone(), new.clone()));
        }
    }

    // Pair moves by digest, first match in path order.
    let mut paired_removals: HashSet<PathBuf> = HashSet::new();
    for (path, new) in created {
        let source = new.digest().and_then(|digest| {
            removed
                .iter()
                .find(|(from, old)| old.digest() == Some(digest) && !paired_removals.contains(from))
                .cloned()
        });
        match source {
            Some((from, old)) => {
                paired_removals.insert(from.clone());
                changes.push(ResourceChange::path(
                    ChangeKind::Moved { from },
                    path,
                    Some(old),
                    Some(new),
                ));
            }
            None => changes.push(ResourceChange::path(ChangeKind::Created, path, None, Some(new))),
        }
    }
    for (path, old) in removed {
        if !paired_removals.contains(&path) {
            changes.push(ResourceChange::path(ChangeKind::Removed, path, Some(old), None));
        }
    }

    for (name, old) in &before.packages {
        let new = after.packages.get(name).cloned().flatten();
        if *old == new {
            continue;
        }
        let kind = match (old, &new) {
            (None, Some(_)) => ChangeKind::Created,
            (Some(_), None) => ChangeKind::Removed,
            _ => ChangeKind::Modified,
        };
        changes.push(ResourceChange {
            resource: ResourceRef::Package(name.clone()),
            kind,
            before: None,
            after: None,
            detail: Some(format!(
                "{} -> {}",
                old.as_deref().unwrap_or("absent"),
                new.as_deref().unwrap_or("absent")
            )),
        });
    }

    for (name, old) in &before.processes {
        let new = after.processes.get(name).copied().unwrap_or(0);
        if *old == new {
            continue;
        }
        let kind = match (*old, new) {
            (0, _) => ChangeKind::Created,
            (_, 0) => ChangeKind::Removed,
            _ => ChangeKind::Modified,
        };
        changes.push(ResourceChange {
            resource: ResourceRef::Process(name.clone()),
            kind,
            before: None,
            after: None,
            detail: Some(format!("{old} -> {new} running")),
        });
    }

    changes.sort_by(|a, b| a.resource.cmp(&b.resource));
    StateDiff {
        changes,
        predicted: false,
    }
}

/// Predict the diff of `op` without running it. Reads metadata only.
pub fn predict(op: &Operation) -> StateDiff {
    let mut changes: Vec<ResourceChange> = Vec::new();
    let mut seen: BTreeSet<ResourceRef> = BTreeSet::new();
    let mut push = |change: ResourceChange| {
        if seen.insert(change.resource.clone()) {
            changes.push(change);
        }
    };

    for cmd in op.commands() {
        match cmd.action {
            CommandAction::Delete => {
                for target in &cmd.targets {
                    push(ResourceChange::path(ChangeKind::Removed, target.clone(), None, None));
                }
            }
            CommandAction::Move | CommandAction::Copy => {
                if let Some(dest) = &cmd.destination {
                    for src in &cmd.targets {
                        let to = landing_path(src, dest);
                        let kind = if cmd.action == CommandAction::Move {
                            ChangeKind::Moved { from: src.clone() }
                        } else {
                            ChangeKind::Created
                        };
                        push(ResourceChange::path(kind, to, None, None));
                    }
                }
            }
            CommandAction::Install | CommandAction::Remove => {
                let kind = if cmd.action == CommandAction::Install {
                    ChangeKind::Created
                } else {
                    ChangeKind::Removed
                };
                for package in &cmd.packages {
                    push(ResourceChange {
                        resource: ResourceRef::Package(package.clone()),
                        kind: kind.clone(),
                        before: None,
                        after: None,
                        detail: None,
                    });
                }
            }
            CommandAction::Signal | CommandAction::Service => {
                for process in &cmd.processes {
                    push(ResourceChange {
                        resource: ResourceRef::Process(process.clone()),
                        kind: ChangeKind::Modified,
                        before: None,
                        after: None,
                        detail: Some("signalled".to_string()),
                    });
                }
            }
            _ => {
                for path in cmd.mutated_paths() {
                    push(created_or_modified(path));
                }
            }
        }
        // Redirect targets are written whatever the program does.
        for path in &cmd.redirect_writes {
            push(created_or_modified(path));
        }
    }

    changes.sort_by(|a, b| a.resource.cmp(&b.resource));
    StateDiff {
        changes,
        predicted: true,
    }
}

fn landing_path(src: &Path, dest: &Path) -> PathBuf {
    match src.file_name() {
        Some(name) if dest.is_dir() => dest.join(name),
        _ => dest.to_path_buf(),
    }
}

fn created_or_modified(path: &Path) -> ResourceChange {
    let kind = if std::fs::symlink_metadata(path).is_ok() {
        ChangeKind::Modified
    } else {
        ChangeKind::Created
    };
    ResourceChange::path(kind, path.to_path_buf(), None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(digest: &str) -> EntryState {
        EntryState::File {
            size: 1,
            digest: Some(digest.to_string()),
            mode: 0o644,
            modified_ns: None,
        }
    }

    fn snap(files: &[(&str, EntryState)]) -> Snapshot {
        let mut s = Snapshot::empty();
        for (p, e) in files {
            s.files.insert(PathBuf::from(p), e.clone());
        }
        s
    }

    #[test]
    fn test_identical_snapshots_have_empty_diff() {
        let a = snap(&[("/w/a", file("aa")), ("/w", EntryState::Dir { mode: 0o755 })]);
        let b = a.clone();
        let d = diff(&a, &b);
        assert!(d.is_empty());
        assert_eq!(d.summary(), "no changes");
    }

    #[test]
    fn test_created_removed_modified() {
        let before = snap(&[("/w/a", file("aa")), ("/w/b", file("bb"))]);
        let after = snap(&[("/w/a", file("a2")), ("/w/c", file("cc"))]);
        let d = diff(&before, &after);
        let kinds: Vec<(String, ChangeKind)> = d
            .changes
            .iter()
            .map(|c| (c.resource.to_string(), c.kind.clone()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("/w/a".to_string(), ChangeKind::Modified),
                ("/w/b".to_string(), ChangeKind::Removed),
                ("/w/c".to_string(), ChangeKind::Created),
            ]
        );
        assert_eq!(d.summary(), "1 created, 1 removed, 1 modified");
    }

    #[test]
    fn test_move_detected_by_digest() {
        let before = snap(&[("/w/old.txt", file("same"))]);
        let after = snap(&[("/w/new.txt", file("same"))]);
        let d = diff(&before, &after);
        assert_eq!(d.changes.len(), 1);
        assert_eq!(
            d.changes[0].kind,
            ChangeKind::Moved {
                from: PathBuf::from("/w/old.txt")
            }
        );
    }

    #[test]
    fn test_package_and_process_changes() {
        let mut before = Snapshot::empty();
        before.packages.insert("nginx".into(), Some("1.24".into()));
        before.processes.insert("nginx".into(), 2);
        let mut after = Snapshot::empty();
        after.packages.insert("nginx".into(), None);
        after.processes.insert("nginx".into(), 0);

        let d = diff(&before, &after);
        assert_eq!(d.changes.len(), 2);
        assert!(d.changes.iter().all(|c| c.kind == ChangeKind::Removed));
        assert_eq!(d.changes[0].detail.as_deref(), Some("1.24 -> absent"));
    }

    #[test]
    fn test_predicted_diff_for_delete_and_move() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("dest")).unwrap();
        let op = Operation::new("rm gone.txt && mv a.txt dest", None, dir.path());
        let d = predict(&op);
        assert!(d.predicted);
        assert!(d.observed_changes().is_empty());
        assert!(d
            .changes
            .iter()
            .any(|c| c.resource == ResourceRef::Path(dir.path().join("gone.txt"))
                && c.kind == ChangeKind::Removed));
        assert!(d
            .changes
            .iter()
            .any(|c| c.resource == ResourceRef::Path(dir.path().join("dest/a.txt"))));
        assert!(d.summary().starts_with("predicted: "));
    }

    #[test]
    fn test_predicted_redirect_write() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::new("echo hi > out.txt", None, dir.path());
        let d = predict(&op);
        assert_eq!(d.changes.len(), 1);
        assert_eq!(d.changes[0].kind, ChangeKind::Created);
    }
}
