//! Inverse actions for the reversible part of an observed diff.
//!
//! Only categories that declare a reversible diff get actions. Created files
//! and directories are removed, moved entries are moved back and removed
//! directories are recreated. Removed file content, modifications, packages
//! and processes cannot be restored and are listed as irreversible.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{OperationCategory, StepId};
use crate::tracker::snapshot::hash_file;
use crate::tracker::{ChangeKind, EntryState, ResourceRef, StateDiff};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InverseAction {
    /// Remove a created file, provided it still has the content it was
    /// created with.
    RemoveFile {
        path: PathBuf,
        digest: Option<String>,
        size: Option<u64>,
    },
    /// Remove a created directory once it is empty.
    RemoveDir { path: PathBuf },
    MoveBack { from: PathBuf, to: PathBuf },
    RecreateDir { path: PathBuf, mode: u32 },
}

impl InverseAction {
    fn apply(&self) -> Result<(), String> {
        match self {
            Self::RemoveFile { path, digest, size } => {
                let meta = match std::fs::symlink_metadata(path) {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(format!("{}: {e}", path.display())),
                };
                if meta.is_file() {
                    if let Some(expected) = digest {
                        let current = hash_file(path).map_err(|e| format!("{}: {e}", path.display()))?;
                        if &current != expected {
                            return Err(format!("{} changed since the step ran", path.display()));
                        }
                    } else if size.is_some_and(|s| s != meta.len()) {
                        return Err(format!("{} changed since the step ran", path.display()));
                    }
                }
                std::fs::remove_file(path).map_err(|e| format!("remove {}: {e}", path.display()))
            }
            Self::RemoveDir { path } => match std::fs::remove_dir(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    Err(format!("remove dir {}: {e}", path.display()))
                }
                _ => Ok(()),
            },
            Self::MoveBack { from, to } => {
                if std::fs::symlink_metadata(to).is_ok() {
                    return Err(format!("{} already exists", to.display()));
                }
                if let Some(parent) = to.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| format!("create {}: {e}", parent.display()))?;
                }
                std::fs::rename(from, to)
                    .map_err(|e| format!("move {} back to {}: {e}", from.display(), to.display()))
            }
            Self::RecreateDir { path, mode } => {
                std::fs::create_dir_all(path).map_err(|e| format!("recreate {}: {e}", path.display()))?;
                set_mode(path, *mode).map_err(|e| format!("chmod {}: {e}", path.display()))
            }
        }
    }

    /// Apply order: recreate, move back, remove files, remove dirs.
    fn phase(&self) -> u8 {
        match self {
            Self::RecreateDir { .. } => 0,
            Self::MoveBack { .. } => 1,
            Self::RemoveFile { .. } => 2,
            Self::RemoveDir { .. } => 3,
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::RemoveFile { path, .. } | Self::RemoveDir { path } | Self::RecreateDir { path, .. } => path,
            Self::MoveBack { from, .. } => from,
        }
    }
}

impl std::fmt::Display for InverseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemoveFile { path, .. } => write!(f, "remove {}", path.display()),
            Self::RemoveDir { path } => write!(f, "rmdir {}", path.display()),
            Self::MoveBack { from, to } => write!(f, "move {} -> {}", from.display(), to.display()),
            Self::RecreateDir { path, mode } => write!(f, "mkdir {} ({mode:o})", path.display()),
        }
    }
}

/// Inverse actions for one step, in apply order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub actions: Vec<InverseAction>,
    /// Changes no action can undo, as display strings.
    pub irreversible: Vec<String>,
}

impl RollbackPlan {
    pub fn from_diff(category: OperationCategory, diff: &StateDiff) -> Self {
        let mut plan = Self::default();
        for change in diff.observed_changes() {
            let action = match (&change.resource, &change.kind) {
                _ if !category.declares_reversible_diff() => None,
                (ResourceRef::Path(path), ChangeKind::Created) => match &change.after {
                    Some(EntryState::Dir { .. }) => Some(InverseAction::RemoveDir { path: path.clone() }),
                    Some(EntryState::File { digest, size, .. }) => Some(InverseAction::RemoveFile {
                        path: path.clone(),
                        digest: digest.clone(),
                        size: Some(*size),
                    }),
                    Some(EntryState::Symlink { .. }) => Some(InverseAction::RemoveFile {
                        path: path.clone(),
                        digest: None,
                        size: None,
                    }),
                    _ => None,
                },
                (ResourceRef::Path(path), ChangeKind::Moved { from }) => Some(InverseAction::MoveBack {
                    from: path.clone(),
                    to: from.clone(),
                }),
                (ResourceRef::Path(path), ChangeKind::Removed) => match &change.before {
                    Some(EntryState::Dir { mode }) => Some(InverseAction::RecreateDir {
                        path: path.clone(),
                        mode: *mode,
                    }),
                    _ => None,
                },
                _ => None,
            };
            match action {
                Some(action) => plan.actions.push(action),
                None => plan.irreversible.push(change.to_string()),
            }
        }
        plan.actions.sort_by(|a, b| {
            let depth = |p: &Path| p.components().count();
            a.phase().cmp(&b.phase()).then_with(|| match a.phase() {
                // Parents first when recreating, children first when removing.
                0 => depth(a.path()).cmp(&depth(b.path())),
                _ => depth(b.path()).cmp(&depth(a.path())),
            })
        });
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.irreversible.is_empty()
    }

    /// Apply every action, best effort. Errors are collected, not raised.
    pub fn apply(&self, step_id: StepId) -> RollbackRecord {
        let mut errors = Vec::new();
        let mut applied = 0usize;
        for action in &self.actions {
            match action.apply() {
                Ok(()) => {
                    debug!(step = %step_id, %action, "inverse action applied");
                    applied += 1;
                }
                Err(e) => {
                    warn!(step = %step_id, %action, error = %e, "inverse action failed");
                    errors.push(e);
                }
            }
        }
        RollbackRecord {
            step_id,
            actions: self.actions.clone(),
            applied,
            irreversible: self.irreversible.clone(),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        }
    }
}

/// What a rollback of one step did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub step_id: StepId,
    pub actions: Vec<InverseAction>,
    pub applied: usize,
    pub irreversible: Vec<String>,
    pub error: Option<String>,
}

impl RollbackRecord {
    /// Every planned inverse action applied.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// The step's changes are fully undone: no errors and nothing
    /// irreversible left behind.
    pub fn restored(&self) -> bool {
        self.succeeded() && self.irreversible.is_empty()
    }

    /// Record for a rollback that could not be attempted at all.
    pub fn failed(step_id: StepId, reason: impl Into<String>) -> Self {
        Self {
            step_id,
            actions: Vec::new(),
            applied: 0,
            irreversible: Vec::new(),
            error: Some(reason.into()),
        }
    }

    pub fn summary(&self) -> String {
        let mut s = format!("{}/{} actions applied", self.applied, self.actions.len());
        if !self.irreversible.is_empty() {
            s.push_str(&format!(", {} irreversible", self.irreversible.len()));
        }
        if let Some(e) = &self.error {
            s.push_str(&format!(", error: {e}"));
        }
        s
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ResourceChange;

    fn change(kind: ChangeKind, path: &Path, before: Option<EntryState>, after: Option<EntryState>) -> ResourceChange {
        ResourceChange {
            resource: ResourceRef::Path(path.to_path_buf()),
            kind,
            before,
            after,
            detail: None,
        }
    }

    fn file_state(path: &Path) -> EntryState {
        EntryState::File {
            size: std::fs::metadata(path).unwrap().len(),
            digest: Some(hash_file(path).unwrap()),
            mode: 0o644,
            modified_ns: None,
        }
    }

    #[test]
    fn test_created_tree_removed_children_first() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = a.join("b");
        std::fs::create_dir_all(&b).unwrap();
        let f = b.join("f.txt");
        std::fs::write(&f, b"x").unwrap();

        let diff = StateDiff {
            changes: vec![
                change(ChangeKind::Created, &a, None, Some(EntryState::Dir { mode: 0o755 })),
                change(ChangeKind::Created, &b, None, Some(EntryState::Dir { mode: 0o755 })),
                change(ChangeKind::Created, &f, None, Some(file_state(&f))),
            ],
            predicted: false,
        };
        let plan = RollbackPlan::from_diff(OperationCategory::FilesystemMutation, &diff);
        assert_eq!(plan.actions.len(), 3);
        let record = plan.apply(StepId(1));
        assert!(record.succeeded(), "{:?}", record.error);
        assert!(!a.exists());
    }

    #[test]
    fn test_move_back() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("old.txt");
        let to = dir.path().join("new.txt");
        std::fs::write(&to, b"moved").unwrap();

        let diff = StateDiff {
            changes: vec![change(ChangeKind::Moved { from: from.clone() }, &to, None, Some(file_state(&to)))],
            predicted: false,
        };
        let record = RollbackPlan::from_diff(OperationCategory::FilesystemMutation, &diff).apply(StepId(2));
        assert!(record.succeeded());
        assert_eq!(std::fs::read(&from).unwrap(), b"moved");
        assert!(!to.exists());
    }

    #[test]
    fn test_modified_since_refuses_removal() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f.txt");
        std::fs::write(&f, b"original").unwrap();
        let state = file_state(&f);
        std::fs::write(&f, b"edited later").unwrap();

        let diff = StateDiff {
            changes: vec![change(ChangeKind::Created, &f, None, Some(state))],
            predicted: false,
        };
        let record = RollbackPlan::from_diff(OperationCategory::FilesystemMutation, &diff).apply(StepId(1));
        assert!(!record.succeeded());
        assert!(f.exists());
    }

    #[test]
    fn test_removed_file_is_irreversible() {
        let f = PathBuf::from("/srv/gone.txt");
        let diff = StateDiff {
            changes: vec![change(
                ChangeKind::Removed,
                &f,
                Some(EntryState::File { size: 1, digest: None, mode: 0o644, modified_ns: None }),
                None,
            )],
            predicted: false,
        };
        let plan = RollbackPlan::from_diff(OperationCategory::FilesystemMutation, &diff);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.irreversible.len(), 1);

        let record = plan.apply(StepId(3));
        assert!(record.succeeded());
        assert!(!record.restored());
        assert!(record.summary().contains("1 irreversible"));
    }

    #[test]
    fn test_non_reversible_category_and_predicted_diff() {
        let f = PathBuf::from("/srv/new.txt");
        let created = change(ChangeKind::Created, &f, None, Some(EntryState::Dir { mode: 0o755 }));
        let observed = StateDiff { changes: vec![created.clone()], predicted: false };
        let plan = RollbackPlan::from_diff(OperationCategory::PackageManagement, &observed);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.irreversible.len(), 1);

        let predicted = StateDiff { changes: vec![created], predicted: true };
        assert!(RollbackPlan::from_diff(OperationCategory::FilesystemMutation, &predicted).is_empty());
    }
}
