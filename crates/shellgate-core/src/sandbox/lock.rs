//! Coarse execution locks for runs that touch the real system.
//!
//! A scope is a path truncated to `lock_depth` components, or the package
//! database, or the process table. Two path scopes conflict when one is a
//! prefix of the other. Operations the analyser cannot see into lock
//! everything.
//!
//! The shared table serialises executors within one process. It also takes
//! advisory `flock` files so separate `shellgate` processes exclude each
//! other: a path scope holds its own file exclusively and every ancestor's
//! file shared, which makes prefix scopes conflict across processes too.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::debug;

use super::error::{SandboxError, SandboxResult};
use crate::cancel::CancelSignal;
use crate::domain::{Operation, OperationCategory};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockScope {
    Path(PathBuf),
    Packages,
    Processes,
}

impl LockScope {
    fn conflicts(&self, other: &LockScope) -> bool {
        match (self, other) {
            (Self::Path(a), Self::Path(b)) => a.starts_with(b) || b.starts_with(a),
            _ => self == other,
        }
    }
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Packages => f.write_str("pkg:*"),
            Self::Processes => f.write_str("proc:*"),
        }
    }
}

#[derive(Debug)]
struct Held {
    id: u64,
    scopes: BTreeSet<LockScope>,
}

#[derive(Debug, Default)]
struct Inner {
    held: Mutex<Vec<Held>>,
    released: Notify,
    next_id: AtomicU64,
}

/// How often a run blocked by another process re-checks its lock files.
const FILE_LOCK_POLL: Duration = Duration::from_millis(50);

static SHARED: OnceLock<Arc<Inner>> = OnceLock::new();

/// Execution lock table. Clones share one table.
#[derive(Debug, Clone)]
pub struct ResourceLocks {
    depth: usize,
    inner: Arc<Inner>,
    files: Option<LockFiles>,
}

/// Releases its scopes on drop.
#[derive(Debug)]
pub struct LockGuard {
    id: u64,
    scopes: BTreeSet<LockScope>,
    inner: Arc<Inner>,
    _files: Vec<File>,
}

impl LockGuard {
    pub fn scopes(&self) -> &BTreeSet<LockScope> {
        &self.scopes
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self._files.clear();
        let mut held = self.inner.held.lock().unwrap_or_else(|e| e.into_inner());
        held.retain(|h| h.id != self.id);
        drop(held);
        self.inner.released.notify_waiters();
    }
}

impl ResourceLocks {
    /// Private table, not visible to other executors or processes.
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            inner: Arc::new(Inner::default()),
            files: None,
        }
    }

    /// The process-wide table, backed by lock files in the default lock
    /// directory.
    pub fn shared(depth: usize) -> Self {
        Self::shared_in(depth, LockFiles::default_dir())
    }

    /// The process-wide table, backed by lock files in `dir`.
    pub fn shared_in(depth: usize, dir: impl Into<PathBuf>) -> Self {
        Self {
            depth: depth.max(1),
            inner: Arc::clone(SHARED.get_or_init(|| Arc::new(Inner::default()))),
            files: Some(LockFiles { dir: dir.into() }),
        }
    }

    /// Whether `self` and `other` exclude each other.
    pub fn same_table(&self, other: &ResourceLocks) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Scopes `op` needs while it runs.
    pub fn scopes_for(&self, op: &Operation) -> BTreeSet<LockScope> {
        let mut scopes = BTreeSet::new();
        if op.is_opaque() || op.category() == OperationCategory::Unknown {
            scopes.insert(LockScope::Path(PathBuf::from("/")));
            scopes.insert(LockScope::Packages);
            scopes.insert(LockScope::Processes);
            return scopes;
        }
        let res = op.resources();
        for path in res.paths.iter().chain(res.containers.keys()) {
            scopes.insert(LockScope::Path(truncate(path, self.depth)));
        }
        if !res.packages.is_empty() || op.category() == OperationCategory::PackageManagement {
            scopes.insert(LockScope::Packages);
        }
        if !res.processes.is_empty() || op.category() == OperationCategory::ProcessControl {
            scopes.insert(LockScope::Processes);
        }
        scopes
    }

    /// Wait until no held scope conflicts with `op`'s, then hold them.
    pub async fn acquire(&self, op: &Operation, cancel: &CancelSignal) -> SandboxResult<LockGuard> {
        let scopes = self.scopes_for(op);
        let mut guard = loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(guard) = self.try_hold(&scopes) {
                break guard;
            }
            debug!(?scopes, "waiting for execution lock");
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => {
                    return Err(SandboxError::Lock("cancelled while waiting for lock".to_string()));
                }
            }
        };

        if let Some(files) = &self.files {
            loop {
                if let Some(held) = files.try_lock(&scopes)? {
                    guard._files = held;
                    break;
                }
                debug!(?scopes, dir = %files.dir.display(), "waiting for another process");
                tokio::select! {
                    _ = tokio::time::sleep(FILE_LOCK_POLL) => {}
                    _ = cancel.cancelled() => {
                        return Err(SandboxError::Lock("cancelled while waiting for lock".to_string()));
                    }
                }
            }
        }
        debug!(scopes = ?guard.scopes, "execution lock acquired");
        Ok(guard)
    }

    fn try_hold(&self, scopes: &BTreeSet<LockScope>) -> Option<LockGuard> {
        let mut held = self.inner.held.lock().unwrap_or_else(|e| e.into_inner());
        let busy = held
            .iter()
            .any(|h| h.scopes.iter().any(|a| scopes.iter().any(|b| a.conflicts(b))));
        if busy {
            return None;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        held.push(Held {
            id,
            scopes: scopes.clone(),
        });
        Some(LockGuard {
            id,
            scopes: scopes.clone(),
            inner: Arc::clone(&self.inner),
            _files: Vec::new(),
        })
    }
}

/// Advisory lock files shared between processes.
#[derive(Debug, Clone)]
struct LockFiles {
    dir: PathBuf,
}

impl LockFiles {
    fn default_dir() -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("shellgate-locks")
    }

    /// Take every file `scopes` need without blocking, or none of them.
    fn try_lock(&self, scopes: &BTreeSet<LockScope>) -> SandboxResult<Option<Vec<File>>> {
        let mut wanted: BTreeMap<String, bool> = BTreeMap::new();
        for scope in scopes {
            match scope {
                LockScope::Path(path) => {
                    for ancestor in path.ancestors().skip(1) {
                        wanted.entry(path_key(ancestor)).or_insert(false);
                    }
                    *wanted.entry(path_key(path)).or_insert(true) = true;
                }
                LockScope::Packages => {
                    wanted.insert("packages".to_string(), true);
                }
                LockScope::Processes => {
                    wanted.insert("processes".to_string(), true);
                }
            }
        }

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SandboxError::Lock(format!("create {}: {e}", self.dir.display())))?;
        let mut held = Vec::with_capacity(wanted.len());
        for (name, exclusive) in wanted {
            let path = self.dir.join(format!("{name}.lock"));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| SandboxError::Lock(format!("open {}: {e}", path.display())))?;
            if !try_flock(&file, exclusive)
                .map_err(|e| SandboxError::Lock(format!("lock {}: {e}", path.display())))?
            {
                return Ok(None);
            }
            held.push(file);
        }
        Ok(Some(held))
    }
}

fn path_key(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    format!("path-{}", &hex::encode(digest)[..32])
}

#[cfg(unix)]
fn try_flock(file: &File, exclusive: bool) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let mode = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    // SAFETY: the descriptor is owned by `file` and open for the whole call.
    if unsafe { libc::flock(file.as_raw_fd(), mode | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File, _exclusive: bool) -> std::io::Result<bool> {
    Ok(true)
}

fn truncate(path: &Path, depth: usize) -> PathBuf {
    let mut out = PathBuf::new();
    let mut normal = 0;
    for component in path.components() {
        if let Component::Normal(_) = component {
            if normal == depth {
                break;
            }
            normal += 1;
        }
        out.push(component);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_truncate_to_depth() {
        assert_eq!(truncate(Path::new("/srv/data/a/b"), 2), PathBuf::from("/srv/data"));
        assert_eq!(truncate(Path::new("/srv"), 2), PathBuf::from("/srv"));
    }

    #[test]
    fn test_scopes_for_package_and_opaque_ops() {
        let locks = ResourceLocks::new(2);
        let pkg = locks.scopes_for(&Operation::new("apt-get install jq", None, "/"));
        assert!(pkg.contains(&LockScope::Packages));

        let opaque = locks.scopes_for(&Operation::new("bash -c 'rm x'", None, "/"));
        assert!(opaque.contains(&LockScope::Path(PathBuf::from("/"))));
    }

    #[tokio::test]
    async fn test_overlapping_scopes_serialise() {
        let locks = ResourceLocks::new(2);
        let a = Operation::new("rm -r /srv/data/a", None, "/");
        let b = Operation::new("rm -r /srv", None, "/");
        let first = locks.acquire(&a, &CancelSignal::never()).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(&b, &CancelSignal::never()).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_scopes_run_together() {
        let locks = ResourceLocks::new(2);
        let a = Operation::new("rm -r /srv/a", None, "/");
        let b = Operation::new("rm -r /srv/b", None, "/");
        let _first = locks.acquire(&a, &CancelSignal::never()).await.unwrap();
        let second = tokio::time::timeout(
            Duration::from_millis(200),
            locks.acquire(&b, &CancelSignal::never()),
        )
        .await;
        assert!(second.unwrap().is_ok());
    }

    #[test]
    fn test_shared_tables_are_one_table() {
        let dir = tempfile::tempdir().unwrap();
        let a = ResourceLocks::shared_in(2, dir.path());
        let b = ResourceLocks::shared_in(3, dir.path());
        assert!(a.same_table(&b));
        assert!(!a.same_table(&ResourceLocks::new(2)));
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_files_follow_scope_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let files = LockFiles { dir: dir.path().to_path_buf() };
        let scopes = |paths: &[&str]| -> BTreeSet<LockScope> {
            paths.iter().map(|p| LockScope::Path(PathBuf::from(p))).collect()
        };

        let held = files.try_lock(&scopes(&["/srv/data"])).unwrap().unwrap();
        // Separate open file descriptions contend like separate processes.
        assert!(files.try_lock(&scopes(&["/srv"])).unwrap().is_none());
        assert!(files.try_lock(&scopes(&["/srv/data"])).unwrap().is_none());
        assert!(files.try_lock(&[LockScope::Path("/".into())].into()).unwrap().is_none());
        let sibling = files.try_lock(&scopes(&["/srv/logs"])).unwrap();
        assert!(sibling.is_some());

        drop(held);
        assert!(files.try_lock(&scopes(&["/srv"])).unwrap().is_none());
        drop(sibling);
        assert!(files.try_lock(&scopes(&["/srv"])).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let locks = ResourceLocks::new(2);
        let op = Operation::new("rm -r /srv/a", None, "/");
        let _held = locks.acquire(&op, &CancelSignal::never()).await.unwrap();
        let (handle, signal) = crate::cancel::cancel_pair();
        handle.cancel();
        let err = locks.acquire(&op, &signal).await.unwrap_err();
        assert!(matches!(err, SandboxError::Lock(_)));
    }
}
