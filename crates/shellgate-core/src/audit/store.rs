//! Audit log trait and the durable JSONL store.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::entry::{verify_chain, AuditEntry, AuditRecord};
use super::error::{AuditError, AuditResult};

/// Append-only record of what the engine classified, ran and cancelled.
///
/// `append` returns only after the entry is durable.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, record: AuditRecord) -> AuditResult<AuditEntry>;

    /// All entries, oldest first.
    async fn entries(&self) -> AuditResult<Vec<AuditEntry>>;

    /// Verify the hash chain; returns the entry count.
    async fn verify(&self) -> AuditResult<usize> {
        let entries = self.entries().await?;
        verify_chain(&entries)
    }
}

#[derive(Debug)]
struct Tail {
    file: File,
    next_seq: u64,
    last_digest: Option<String>,
}

/// One JSON entry per line, fsynced on every append.
#[derive(Debug, Clone)]
pub struct JsonlAuditLog {
    path: PathBuf,
    tail: Arc<Mutex<Tail>>,
}

impl JsonlAuditLog {
    /// `<data dir>/shellgate/audit.jsonl`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("shellgate").join("audit.jsonl"))
    }

    /// Open or create the log. A torn trailing line left by a crash is
    /// truncated; a corrupt complete line is an error.
    pub fn open(path: impl AsRef<Path>) -> AuditResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let complete = contents
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        if complete < contents.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = contents.len() - complete,
                "truncating torn audit line"
            );
            file.set_len(complete as u64)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;

        let entries = parse_lines(&contents[..complete])?;
        let tail = Tail {
            file,
            next_seq: entries.last().map(|e| e.seq + 1).unwrap_or(0),
            last_digest: entries.last().map(|e| e.digest.clone()),
        };
        debug!(path = %path.display(), entries = entries.len(), "audit log opened");
        Ok(Self {
            path,
            tail: Arc::new(Mutex::new(tail)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn append(&self, record: AuditRecord) -> AuditResult<AuditEntry> {
        let tail = Arc::clone(&self.tail);
        tokio::task::spawn_blocking(move || {
            let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
            let entry = AuditEntry::seal(tail.next_seq, record, tail.last_digest.clone())?;
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            tail.file.write_all(&line)?;
            tail.file.sync_data()?;
            tail.next_seq += 1;
            tail.last_digest = Some(entry.digest.clone());
            Ok(entry)
        })
        .await
        .map_err(|e| AuditError::Unavailable(format!("append task failed: {e}")))?
    }

    async fn entries(&self) -> AuditResult<Vec<AuditEntry>> {
        let contents = tokio::fs::read(&self.path).await?;
        let complete = contents
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        parse_lines(&contents[..complete])
    }
}

fn parse_lines(bytes: &[u8]) -> AuditResult<Vec<AuditEntry>> {
    let text = std::str::from_utf8(bytes).map_err(|e| AuditError::Corrupt {
        line: 0,
        reason: e.to_string(),
    })?;
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l).map_err(|e| AuditError::Corrupt {
                line: i + 1,
                reason: e.to_string(),
            })
        })
        .collect()
}
