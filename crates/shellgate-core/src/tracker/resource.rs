//! Resource sets and how they are scoped before a snapshot.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::Operation;

/// Observable resources a snapshot covers. Paths are logical (real-system)
/// paths even when the snapshot is taken inside an overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub paths: BTreeSet<PathBuf>,
    pub packages: BTreeSet<String>,
    pub processes: BTreeSet<String>,
}

impl ResourceSet {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.packages.is_empty() && self.processes.is_empty()
    }

    /// Declared resources of `op`, scoped against the filesystem rooted at
    /// `root` (`None` for the real system).
    ///
    /// Missing paths widen to their highest missing ancestor so created parent
    /// directories are observed. Existing move/copy destination directories
    /// narrow to the entries placed into them.
    pub fn scoped(op: &Operation, root: Option<&Path>) -> Self {
        let declared = op.resources();
        let mut paths = BTreeSet::new();

        for path in &declared.paths {
            paths.insert(widen(path, root));
        }
        for (dir, names) in &declared.containers {
            let physical = physical_path(root, dir);
            if physical.is_dir() && !names.is_empty() {
                for name in names {
                    paths.insert(dir.join(name));
                }
            } else {
                paths.insert(widen(dir, root));
            }
        }
        // Move sources live in `paths` already; copies only read theirs.

        Self {
            paths: prune_nested(paths),
            packages: declared.packages.clone(),
            processes: declared.processes.clone(),
        }
    }
}

/// Map a logical path into `root`.
pub fn physical_path(root: Option<&Path>, logical: &Path) -> PathBuf {
    match root {
        Some(root) => root.join(logical.strip_prefix("/").unwrap_or(logical)),
        None => logical.to_path_buf(),
    }
}

fn exists(root: Option<&Path>, logical: &Path) -> bool {
    std::fs::symlink_metadata(physical_path(root, logical)).is_ok()
}

fn widen(path: &Path, root: Option<&Path>) -> PathBuf {
    let mut current = path.to_path_buf();
    if exists(root, &current) {
        return current;
    }
    while let Some(parent) = current.parent() {
        if exists(root, parent) {
            break;
        }
        current = parent.to_path_buf();
    }
    current
}

/// Drop paths covered by an ancestor already in the set.
fn prune_nested(paths: BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    paths
        .iter()
        .filter(|p| !paths.iter().any(|q| q != *p && p.starts_with(q)))
        .cloned()
        .collect()
}
