//! Package and process probes.
//!
//! `HostProbe` asks the system package database and `/proc`; `StaticProbe`
//! is an in-memory fake for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::sandbox::error::{SandboxError, SandboxResult};

/// Reads package and process state for snapshots.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    /// Installed version of each package, `None` when absent.
    async fn package_versions(
        &self,
        packages: &BTreeSet<String>,
    ) -> SandboxResult<BTreeMap<String, Option<String>>>;

    /// Running instance count per process name or pid.
    async fn process_counts(
        &self,
        processes: &BTreeSet<String>,
    ) -> SandboxResult<BTreeMap<String, usize>>;
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Probe backed by `dpkg-query`/`rpm` and `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

impl HostProbe {
    async fn query_version(package: &str) -> SandboxResult<Option<String>> {
        let attempts: [(&str, &[&str]); 2] = [
            ("dpkg-query", &["-W", "-f=${Version}"]),
            ("rpm", &["-q", "--qf", "%{VERSION}-%{RELEASE}"]),
        ];
        for (program, args) in attempts {
            let output = match Command::new(program).args(args).arg(package).output().await {
                Ok(output) => output,
                // Tool not installed on this host; try the next one.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SandboxError::Probe(format!("{program}: {e}"))),
            };
            if output.status.success() {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                return Ok((!version.is_empty()).then_some(version));
            }
            return Ok(None);
        }
        Ok(None)
    }
}

#[async_trait]
impl SystemProbe for HostProbe {
    async fn package_versions(
        &self,
        packages: &BTreeSet<String>,
    ) -> SandboxResult<BTreeMap<String, Option<String>>> {
        let mut versions = BTreeMap::new();
        for package in packages {
            versions.insert(package.clone(), Self::query_version(package).await?);
        }
        Ok(versions)
    }

    async fn process_counts(
        &self,
        processes: &BTreeSet<String>,
    ) -> SandboxResult<BTreeMap<String, usize>> {
        if processes.is_empty() {
            return Ok(BTreeMap::new());
        }
        let wanted = processes.clone();
        let counts = tokio::task::spawn_blocking(move || scan_proc(&wanted))
            .await
            .map_err(|e| SandboxError::Probe(e.to_string()))??;
        debug!(?counts, "probed processes");
        Ok(counts)
    }
}

fn scan_proc(wanted: &BTreeSet<String>) -> SandboxResult<BTreeMap<String, usize>> {
    let mut counts: BTreeMap<String, usize> = wanted.iter().map(|p| (p.clone(), 0)).collect();
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(counts),
        Err(e) => return Err(SandboxError::Probe(format!("/proc: {e}"))),
    };
    for entry in entries.flatten() {
        let pid = entry.file_name().to_string_lossy().into_owned();
        if !pid.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let comm = std::fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
        let comm = comm.trim();
        for (name, count) in counts.iter_mut() {
            if *name == pid || (!comm.is_empty() && name == comm) {
                *count += 1;
            }
        }
    }
    Ok(counts)
}

// ---------------------------------------------------------------------------
// Fake
// ---------------------------------------------------------------------------

/// In-memory probe. Unknown packages are absent, unknown processes have zero
/// instances.
#[derive(Debug, Default)]
pub struct StaticProbe {
    packages: Mutex<HashMap<String, String>>,
    processes: Mutex<HashMap<String, usize>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_package(&self, name: &str, version: Option<&str>) {
        let mut packages = self.packages.lock().unwrap_or_else(|e| e.into_inner());
        match version {
            Some(v) => {
                packages.insert(name.to_string(), v.to_string());
            }
            None => {
                packages.remove(name);
            }
        }
    }

    pub fn set_process(&self, name: &str, count: usize) {
        self.processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), count);
    }
}

#[async_trait]
impl SystemProbe for StaticProbe {
    async fn package_versions(
        &self,
        packages: &BTreeSet<String>,
    ) -> SandboxResult<BTreeMap<String, Option<String>>> {
        let known = self.packages.lock().unwrap_or_else(|e| e.into_inner());
        Ok(packages
            .iter()
            .map(|p| (p.clone(), known.get(p).cloned()))
            .collect())
    }

    async fn process_counts(
        &self,
        processes: &BTreeSet<String>,
    ) -> SandboxResult<BTreeMap<String, usize>> {
        let known = self.processes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(processes
            .iter()
            .map(|p| (p.clone(), known.get(p).copied().unwrap_or(0)))
            .collect())
    }
}
