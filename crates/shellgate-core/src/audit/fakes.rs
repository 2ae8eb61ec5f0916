//! In-memory audit log for tests and embedding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::entry::{AuditEntry, AuditOutcome, AuditRecord};
use super::error::{AuditError, AuditResult};
use super::store::AuditLog;
use crate::domain::StepId;

// ---------------------------------------------------------------------------
// MemoryAuditLog
// ---------------------------------------------------------------------------

/// Keeps entries in a `Vec`. Appends can be made to fail to exercise the
/// write-ahead path.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    failing: AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every append while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Outcomes recorded for `step`, in order.
    pub fn outcomes_for(&self, step: StepId) -> Vec<AuditOutcome> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.record.step_id == step)
            .map(|e| e.record.outcome)
            .collect()
    }

    pub fn count(&self, outcome: AuditOutcome) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.record.outcome == outcome)
            .count()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, record: AuditRecord) -> AuditResult<AuditEntry> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("memory log set to fail".to_string()));
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let prev = entries.last().map(|e| e.digest.clone());
        let entry = AuditEntry::seal(entries.len() as u64, record, prev)?;
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn entries(&self) -> AuditResult<Vec<AuditEntry>> {
        Ok(self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(step: u32, outcome: AuditOutcome) -> AuditRecord {
        AuditRecord {
            plan_id: Uuid::nil(),
            step_id: StepId(step),
            operation_text: "ls".to_string(),
            risk_profile: None,
            mode_used: None,
            outcome,
            failure: None,
            diff_summary: None,
            message: None,
        }
    }

    #[tokio::test]
    async fn test_memory_log_chains_and_filters() {
        let log = MemoryAuditLog::new();
        log.append(record(1, AuditOutcome::Classified)).await.unwrap();
        log.append(record(2, AuditOutcome::Classified)).await.unwrap();
        log.append(record(1, AuditOutcome::Succeeded)).await.unwrap();

        assert_eq!(log.verify().await.unwrap(), 3);
        assert_eq!(
            log.outcomes_for(StepId(1)),
            vec![AuditOutcome::Classified, AuditOutcome::Succeeded]
        );
        assert_eq!(log.count(AuditOutcome::Classified), 2);
    }

    #[tokio::test]
    async fn test_failing_log_rejects_appends() {
        let log = MemoryAuditLog::new();
        log.set_failing(true);
        assert!(log.append(record(1, AuditOutcome::Started)).await.is_err());
        assert!(log.snapshot().is_empty());
    }
}
