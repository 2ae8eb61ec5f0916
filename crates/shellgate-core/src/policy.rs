//! Policy context: thresholds, paths and timeouts shared by the classifier
//! and the executor.
//!
//! A `PolicyContext` is immutable once handed to the engine; callers share it
//! behind an `Arc`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::RuleSet;
use crate::domain::{Result, SandboxMode, ShellgateError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyContext {
    /// Disposable directories; recursive deletes inside them are only Destructive.
    pub scratch_paths: Vec<PathBuf>,
    /// Paths whose mutation is Critical. `/` only matches itself.
    pub protected_paths: Vec<PathBuf>,
    /// Hosts egress may reach without escalating to Destructive.
    /// A leading `.` matches any subdomain.
    pub known_hosts: Vec<String>,
    /// Floor applied to every step unless a plan overrides it.
    pub default_mode_floor: SandboxMode,

    pub simulation_timeout_ms: u64,
    pub isolated_timeout_ms: u64,
    /// Unbounded when unset.
    pub validation_timeout_ms: Option<u64>,
    /// Unanswered confirmations are declined after this long.
    pub confirmation_timeout_ms: u64,
    /// Time between SIGTERM and SIGKILL when stopping a process group.
    pub cancel_grace_ms: u64,

    pub snapshot_max_entries: usize,
    /// Files larger than this are recorded by size only.
    pub snapshot_hash_limit_bytes: u64,
    pub max_output_bytes: usize,
    /// Path components that form a lock scope.
    pub lock_depth: usize,
    /// RLIMIT_FSIZE for Isolated runs.
    pub isolated_max_file_bytes: u64,
    /// Roll back succeeded steps after an abort, not just on cancellation.
    pub rollback_on_abort: bool,
    pub working_dir: Option<PathBuf>,
    /// Package name to the packages that depend on it.
    pub package_dependents: BTreeMap<String, Vec<String>>,
    /// Replaces the standard rule set when present.
    pub rules: Option<RuleSet>,
}

impl Default for PolicyContext {
    fn default() -> Self {
        let protected = [
            "/", "/etc", "/usr", "/bin", "/sbin", "/boot", "/lib", "/lib64", "/sys", "/proc",
            "/dev", "/var/lib",
        ];
        Self {
            scratch_paths: vec![PathBuf::from("/tmp"), PathBuf::from("/var/tmp")],
            protected_paths: protected.iter().map(PathBuf::from).collect(),
            known_hosts: Vec::new(),
            default_mode_floor: SandboxMode::Isolated,
            simulation_timeout_ms: 30_000,
            isolated_timeout_ms: 30_000,
            validation_timeout_ms: None,
            confirmation_timeout_ms: 60_000,
            cancel_grace_ms: 2_000,
            snapshot_max_entries: 10_000,
            snapshot_hash_limit_bytes: 4 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            lock_depth: 2,
            isolated_max_file_bytes: 1024 * 1024 * 1024,
            rollback_on_abort: true,
            working_dir: None,
            package_dependents: BTreeMap::new(),
            rules: None,
        }
    }
}

impl PolicyContext {
    /// Default location: `<config dir>/shellgate/policy.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("shellgate").join("policy.toml"))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let policy: Self =
            toml::from_str(s).map_err(|e| ShellgateError::InvalidPolicy(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Load and validate a policy file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ShellgateError::InvalidPolicy(msg) => {
                ShellgateError::InvalidPolicy(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ShellgateError::InvalidPolicy(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let relative = self
            .scratch_paths
            .iter()
            .chain(&self.protected_paths)
            .find(|p| !p.is_absolute());
        if let Some(p) = relative {
            return Err(ShellgateError::InvalidPolicy(format!(
                "path must be absolute: {}",
                p.display()
            )));
        }
        if let Some(dir) = &self.working_dir {
            if !dir.is_absolute() {
                return Err(ShellgateError::InvalidPolicy(format!(
                    "working_dir must be absolute: {}",
                    dir.display()
                )));
            }
        }
        let zero = [
            ("simulation_timeout_ms", self.simulation_timeout_ms),
            ("isolated_timeout_ms", self.isolated_timeout_ms),
            ("confirmation_timeout_ms", self.confirmation_timeout_ms),
            ("snapshot_max_entries", self.snapshot_max_entries as u64),
            ("max_output_bytes", self.max_output_bytes as u64),
            ("lock_depth", self.lock_depth as u64),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        if let Some((name, _)) = zero {
            return Err(ShellgateError::InvalidPolicy(format!("{name} must be > 0")));
        }
        if self.validation_timeout_ms == Some(0) {
            return Err(ShellgateError::InvalidPolicy(
                "validation_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_scratch_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_paths.push(path.into());
        self
    }

    pub fn with_known_host(mut self, host: impl Into<String>) -> Self {
        self.known_hosts.push(host.into());
        self
    }

    pub fn with_dependents(
        mut self,
        package: impl Into<String>,
        dependents: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.package_dependents.insert(
            package.into(),
            dependents.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn is_scratch(&self, path: &Path) -> bool {
        self.scratch_paths.iter().any(|s| path.starts_with(s))
    }

    pub fn is_protected(&self, path: &Path) -> bool {
        self.protected_paths.iter().any(|p| {
            if p == Path::new("/") {
                path == p
            } else {
                path.starts_with(p)
            }
        })
    }

    pub fn is_known_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.known_hosts.iter().any(|k| {
            let k = k.to_ascii_lowercase();
            match k.strip_prefix('.') {
                Some(suffix) => host == suffix || host.ends_with(&k),
                None => host == k,
            }
        })
    }

    /// Declared dependents of `package`, empty if none.
    pub fn dependents_of(&self, package: &str) -> &[String] {
        self.package_dependents
            .get(package)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Execution time budget for `mode`; `None` means unbounded.
    pub fn timeout_for(&self, mode: SandboxMode) -> Option<Duration> {
        match mode {
            SandboxMode::DryRun => None,
            SandboxMode::Simulation => Some(Duration::from_millis(self.simulation_timeout_ms)),
            SandboxMode::Isolated => Some(Duration::from_millis(self.isolated_timeout_ms)),
            SandboxMode::Validation => self.validation_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let policy = PolicyContext::default();
        policy.validate().unwrap();
        assert_eq!(policy.default_mode_floor, SandboxMode::Isolated);
        assert!(policy.rollback_on_abort);
    }

    #[test]
    fn test_root_protection_is_exact() {
        let policy = PolicyContext::default();
        assert!(policy.is_protected(Path::new("/")));
        assert!(policy.is_protected(Path::new("/etc/passwd")));
        assert!(!policy.is_protected(Path::new("/home/me/notes")));
        assert!(!policy.is_protected(Path::new("/var/log/app.log")));
    }

    #[test]
    fn test_scratch_matching() {
        let policy = PolicyContext::default().with_scratch_path("/data/tmp");
        assert!(policy.is_scratch(Path::new("/data/tmp")));
        assert!(policy.is_scratch(Path::new("/data/tmp/a/b")));
        assert!(!policy.is_scratch(Path::new("/data/tmpfoo")));
    }

    #[test]
    fn test_known_host_suffix() {
        let policy = PolicyContext::default()
            .with_known_host(".github.com")
            .with_known_host("pypi.org");
        assert!(policy.is_known_host("api.github.com"));
        assert!(policy.is_known_host("github.com"));
        assert!(policy.is_known_host("PyPI.org"));
        assert!(!policy.is_known_host("evil-github.com"));
    }

    #[test]
    fn test_from_toml_partial() {
        let policy = PolicyContext::from_toml_str(
            r#"
            scratch_paths = ["/data/tmp"]
            known_hosts = ["example.com"]
            isolated_timeout_ms = 500
            default_mode_floor = "simulation"

            [package_dependents]
            libssl3 = ["openssh-server", "curl"]
            "#,
        )
        .unwrap();
        assert_eq!(policy.scratch_paths, vec![PathBuf::from("/data/tmp")]);
        assert_eq!(policy.isolated_timeout_ms, 500);
        assert_eq!(policy.default_mode_floor, SandboxMode::Simulation);
        assert_eq!(policy.dependents_of("libssl3").len(), 2);
        assert_eq!(policy.simulation_timeout_ms, 30_000);
    }

    #[test]
    fn test_relative_scratch_rejected() {
        let err = PolicyContext::from_toml_str(r#"scratch_paths = ["tmp"]"#).unwrap_err();
        assert!(matches!(err, ShellgateError::InvalidPolicy(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = PolicyContext::from_toml_str("isolated_timeout_ms = 0").unwrap_err();
        assert!(err.to_string().contains("isolated_timeout_ms"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "cancel_grace_ms = 250\n").unwrap();
        let policy = PolicyContext::load(&path).unwrap();
        assert_eq!(policy.cancel_grace(), Duration::from_millis(250));
    }

    #[test]
    fn test_timeouts_per_mode() {
        let policy = PolicyContext::default();
        assert_eq!(policy.timeout_for(SandboxMode::DryRun), None);
        assert_eq!(policy.timeout_for(SandboxMode::Validation), None);
        assert_eq!(
            policy.timeout_for(SandboxMode::Isolated),
            Some(Duration::from_millis(30_000))
        );
    }
}
