//! Point-in-time captures of a resource set.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::resource::{physical_path, ResourceSet};
use crate::policy::PolicyContext;
use crate::sandbox::error::{SandboxError, SandboxResult};

/// Observed state of one filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryState {
    File {
        size: u64,
        /// SHA-256 of the content; `None` above the hashing limit.
        digest: Option<String>,
        mode: u32,
        /// Modification time, only kept when the content was not hashed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modified_ns: Option<u64>,
    },
    Dir {
        mode: u32,
    },
    Symlink {
        target: PathBuf,
    },
    Other,
}

impl EntryState {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir { .. })
    }

    pub fn digest(&self) -> Option<&str> {
        match self {
            Self::File { digest, .. } => digest.as_deref(),
            _ => None,
        }
    }
}

/// Bounds applied while walking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotLimits {
    pub max_entries: usize,
    pub hash_limit_bytes: u64,
}

impl SnapshotLimits {
    pub fn from_policy(policy: &PolicyContext) -> Self {
        Self {
            max_entries: policy.snapshot_max_entries,
            hash_limit_bytes: policy.snapshot_hash_limit_bytes,
        }
    }
}

impl Default for SnapshotLimits {
    fn default() -> Self {
        Self::from_policy(&PolicyContext::default())
    }
}

/// Captured state of a resource set. Keys are logical paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub taken_at: DateTime<Utc>,
    pub roots: BTreeSet<PathBuf>,
    pub files: BTreeMap<PathBuf, EntryState>,
    /// Installed version per package, `None` when not installed.
    pub packages: BTreeMap<String, Option<String>>,
    /// Running instance count per process name.
    pub processes: BTreeMap<String, usize>,
}

/// Shared, immutable snapshot.
pub type SnapshotHandle = Arc<Snapshot>;

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            id: Uuid::new_v4(),
            taken_at: Utc::now(),
            roots: BTreeSet::new(),
            files: BTreeMap::new(),
            packages: BTreeMap::new(),
            processes: BTreeMap::new(),
        }
    }
}

/// Walk every path in `set`, reading from `overlay` when given.
pub(crate) fn capture_paths(
    set: &ResourceSet,
    overlay: Option<&Path>,
    limits: SnapshotLimits,
) -> SandboxResult<BTreeMap<PathBuf, EntryState>> {
    let mut files = BTreeMap::new();
    for root in &set.paths {
        let physical = physical_path(overlay, root);
        match std::fs::symlink_metadata(&physical) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(SandboxError::Snapshot {
                    path: root.display().to_string(),
                    reason: e.to_string(),
                })
            }
        }

        for entry in WalkDir::new(&physical).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if files.len() >= limits.max_entries {
                return Err(SandboxError::SurfaceTooLarge {
                    limit: limits.max_entries,
                });
            }
            let logical = match entry.path().strip_prefix(&physical) {
                Ok(rel) if rel.as_os_str().is_empty() => root.clone(),
                Ok(rel) => root.join(rel),
                Err(_) => continue,
            };
            files.insert(logical, entry_state(entry.path(), limits.hash_limit_bytes));
        }
    }
    debug!(roots = set.paths.len(), entries = files.len(), "captured filesystem state");
    Ok(files)
}

fn entry_state(path: &Path, hash_limit: u64) -> EntryState {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return EntryState::Other,
    };
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        let target = std::fs::read_link(path).unwrap_or_default();
        return EntryState::Symlink { target };
    }
    if file_type.is_dir() {
        return EntryState::Dir {
            mode: mode_of(&meta),
        };
    }
    if !file_type.is_file() {
        return EntryState::Other;
    }

    let size = meta.len();
    let digest = if size <= hash_limit {
        hash_file(path).ok()
    } else {
        None
    };
    let modified_ns = match digest {
        Some(_) => None,
        None => meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64),
    };
    EntryState::File {
        size,
        digest,
        mode: mode_of(&meta),
        modified_ns,
    }
}

pub(crate) fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(paths: &[&Path]) -> ResourceSet {
        ResourceSet {
            paths: paths.iter().map(|p| p.to_path_buf()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_capture_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"hello").unwrap();

        let files = capture_paths(&set_of(&[dir.path()]), None, SnapshotLimits::default()).unwrap();
        assert!(files[dir.path()].is_dir());
        let a = &files[&dir.path().join("sub/a.txt")];
        assert_eq!(a.digest().map(str::len), Some(64));
    }

    #[test]
    fn test_missing_root_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let files = capture_paths(&set_of(&[&missing]), None, SnapshotLimits::default()).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_overlay_keys_are_logical() {
        let overlay = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(overlay.path().join("srv/app")).unwrap();
        std::fs::write(overlay.path().join("srv/app/x"), b"1").unwrap();

        let files = capture_paths(
            &set_of(&[Path::new("/srv/app")]),
            Some(overlay.path()),
            SnapshotLimits::default(),
        )
        .unwrap();
        assert!(files.contains_key(Path::new("/srv/app/x")));
    }

    #[test]
    fn test_surface_limit_enforced() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}")), b"x").unwrap();
        }
        let limits = SnapshotLimits {
            max_entries: 3,
            hash_limit_bytes: 1024,
        };
        let err = capture_paths(&set_of(&[dir.path()]), None, limits).unwrap_err();
        assert!(matches!(err, SandboxError::SurfaceTooLarge { limit: 3 }));
    }

    #[test]
    fn test_large_files_not_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        let limits = SnapshotLimits {
            max_entries: 10,
            hash_limit_bytes: 16,
        };
        let files = capture_paths(&set_of(&[&path]), None, limits).unwrap();
        match &files[&path] {
            EntryState::File {
                digest, modified_ns, ..
            } => {
                assert!(digest.is_none());
                assert!(modified_ns.is_some());
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }
}
