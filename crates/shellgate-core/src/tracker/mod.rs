//! Change tracker: scoped snapshots and the diffs between them.
//!
//! - [`resource`] - `ResourceSet` and scoping against the filesystem
//! - [`snapshot`] - `Snapshot`, walked with `walkdir`, hashed with SHA-256
//! - [`probe`] - `SystemProbe` for packages and processes
//! - [`diff`] - `StateDiff`, observed and predicted

pub mod diff;
pub mod probe;
pub mod resource;
pub mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

pub use diff::{predict, ChangeKind, ResourceChange, ResourceRef, StateDiff};
pub use probe::{HostProbe, StaticProbe, SystemProbe};
pub use resource::ResourceSet;
pub use snapshot::{EntryState, Snapshot, SnapshotHandle, SnapshotLimits};

use crate::policy::PolicyContext;
use crate::sandbox::error::{SandboxError, SandboxResult};

/// Takes snapshots of declared resources and compares them.
#[derive(Clone)]
pub struct ChangeTracker {
    limits: SnapshotLimits,
    probe: Arc<dyn SystemProbe>,
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ChangeTracker {
    pub fn new(limits: SnapshotLimits, probe: Arc<dyn SystemProbe>) -> Self {
        Self { limits, probe }
    }

    pub fn from_policy(policy: &PolicyContext, probe: Arc<dyn SystemProbe>) -> Self {
        Self::new(SnapshotLimits::from_policy(policy), probe)
    }

    /// Snapshot `set` on the real system.
    pub async fn snapshot(&self, set: &ResourceSet) -> SandboxResult<SnapshotHandle> {
        self.snapshot_in(set, None).await
    }

    /// Snapshot `set`, reading paths under `root` when given. Packages and
    /// processes always come from the probe.
    pub async fn snapshot_in(
        &self,
        set: &ResourceSet,
        root: Option<&Path>,
    ) -> SandboxResult<SnapshotHandle> {
        let owned_set = set.clone();
        let owned_root: Option<PathBuf> = root.map(Path::to_path_buf);
        let limits = self.limits;
        let files = tokio::task::spawn_blocking(move || {
            snapshot::capture_paths(&owned_set, owned_root.as_deref(), limits)
        })
        .await
        .map_err(|e| SandboxError::Snapshot {
            path: "<walker>".to_string(),
            reason: e.to_string(),
        })??;

        let packages = if set.packages.is_empty() {
            Default::default()
        } else {
            self.probe.package_versions(&set.packages).await?
        };
        let processes = if set.processes.is_empty() {
            Default::default()
        } else {
            self.probe.process_counts(&set.processes).await?
        };

        Ok(Arc::new(Snapshot {
            id: Uuid::new_v4(),
            taken_at: Utc::now(),
            roots: set.paths.clone(),
            files,
            packages,
            processes,
        }))
    }

    pub fn diff(&self, before: &Snapshot, after: &Snapshot) -> StateDiff {
        diff::diff(before, after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Operation;

    fn tracker() -> ChangeTracker {
        ChangeTracker::new(SnapshotLimits::default(), Arc::new(StaticProbe::new()))
    }

    #[tokio::test]
    async fn test_noop_diff_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"data").unwrap();
        let op = Operation::new("touch keep.txt", None, dir.path());
        let set = ResourceSet::scoped(&op, None);

        let t = tracker();
        let before = t.snapshot(&set).await.unwrap();
        let after = t.snapshot(&set).await.unwrap();
        assert!(t.diff(&before, &after).is_empty());
    }

    #[tokio::test]
    async fn test_observes_created_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operation::new("mkdir -p a/b", None, dir.path());
        let set = ResourceSet::scoped(&op, None);

        let t = tracker();
        let before = t.snapshot(&set).await.unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let after = t.snapshot(&set).await.unwrap();

        let d = t.diff(&before, &after);
        let created: Vec<_> = d
            .changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Created)
            .map(|c| c.resource.clone())
            .collect();
        assert_eq!(
            created,
            vec![
                ResourceRef::Path(dir.path().join("a")),
                ResourceRef::Path(dir.path().join("a/b")),
            ]
        );
    }

    #[tokio::test]
    async fn test_package_state_from_probe() {
        let probe = Arc::new(StaticProbe::new());
        probe.set_package("nginx", Some("1.24"));
        let t = ChangeTracker::new(SnapshotLimits::default(), probe.clone());
        let set = ResourceSet {
            packages: ["nginx".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let before = t.snapshot(&set).await.unwrap();
        probe.set_package("nginx", None);
        let after = t.snapshot(&set).await.unwrap();
        let d = t.diff(&before, &after);
        assert_eq!(d.changes.len(), 1);
        assert_eq!(d.changes[0].kind, ChangeKind::Removed);
    }
}
