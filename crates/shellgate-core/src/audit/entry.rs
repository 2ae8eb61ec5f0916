//! Audit entries and the hash chain that links them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::{AuditError, AuditResult};
use crate::domain::{FailureKind, RiskProfile, SandboxMode, Step, StepId};

/// What the entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Classified,
    /// Written before the process is spawned.
    Started,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
    RolledBack,
    /// Reversible changes were undone, irreversible ones remain.
    RolledBackPartially,
    RollbackFailed,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Classified => "classified",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::RolledBack => "rolled_back",
            Self::RolledBackPartially => "rolled_back_partially",
            Self::RollbackFailed => "rollback_failed",
        };
        f.write_str(s)
    }
}

/// The caller-supplied part of an entry. The log assigns sequence number,
/// timestamp and chain digests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub plan_id: Uuid,
    pub step_id: StepId,
    pub operation_text: String,
    pub risk_profile: Option<RiskProfile>,
    pub mode_used: Option<SandboxMode>,
    pub outcome: AuditOutcome,
    pub failure: Option<FailureKind>,
    pub diff_summary: Option<String>,
    pub message: Option<String>,
}

impl AuditRecord {
    /// Record for `step` in its current state.
    pub fn for_step(plan_id: Uuid, step: &Step, outcome: AuditOutcome) -> Self {
        Self {
            plan_id,
            step_id: step.id,
            operation_text: step.operation.raw().to_string(),
            risk_profile: step.risk_profile.clone(),
            mode_used: step.mode_used,
            outcome,
            failure: step.failure.as_ref().map(|f| f.kind),
            diff_summary: step.result.as_ref().map(|r| r.state_diff.summary()),
            message: step.failure.as_ref().map(|f| f.message.clone()),
        }
    }

    pub fn with_mode(mut self, mode: SandboxMode) -> Self {
        self.mode_used = Some(mode);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_diff_summary(mut self, summary: impl Into<String>) -> Self {
        self.diff_summary = Some(summary.into());
        self
    }
}

/// One immutable line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub record: AuditRecord,
    /// Digest of the previous entry; `None` for the first.
    pub prev_digest: Option<String>,
    /// SHA-256 over the entry with this field empty.
    pub digest: String,
}

impl AuditEntry {
    /// Seal `record` as entry `seq` following `prev_digest`.
    pub fn seal(seq: u64, record: AuditRecord, prev_digest: Option<String>) -> AuditResult<Self> {
        let mut entry = Self {
            seq,
            timestamp: Utc::now(),
            record,
            prev_digest,
            digest: String::new(),
        };
        entry.digest = entry.compute_digest()?;
        Ok(entry)
    }

    pub fn compute_digest(&self) -> AuditResult<String> {
        let mut unsealed = self.clone();
        unsealed.digest = String::new();
        let bytes = serde_json::to_vec(&unsealed)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// First 12 hex chars of the digest.
    pub fn short_digest(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}

impl std::fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} {} {} {}",
            self.seq,
            self.timestamp.to_rfc3339(),
            self.record.step_id,
            self.record.outcome,
            self.record.operation_text
        )?;
        if let Some(mode) = self.record.mode_used {
            write!(f, " [{mode}]")?;
        }
        if let Some(summary) = &self.record.diff_summary {
            write!(f, " ({summary})")?;
        }
        Ok(())
    }
}

/// Check sequence numbers, back links and digests. Returns the number of
/// entries verified.
pub fn verify_chain(entries: &[AuditEntry]) -> AuditResult<usize> {
    let mut prev: Option<&AuditEntry> = None;
    for (index, entry) in entries.iter().enumerate() {
        let broken = |reason: &str| AuditError::ChainBroken {
            seq: entry.seq,
            reason: reason.to_string(),
        };
        if entry.seq != index as u64 {
            return Err(broken("sequence gap"));
        }
        if entry.prev_digest.as_deref() != prev.map(|p| p.digest.as_str()) {
            return Err(broken("previous digest does not match"));
        }
        if entry.compute_digest()? != entry.digest {
            return Err(broken("digest mismatch"));
        }
        prev = Some(entry);
    }
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(outcome: AuditOutcome) -> AuditRecord {
        AuditRecord {
            plan_id: Uuid::nil(),
            step_id: StepId(1),
            operation_text: "rm -rf /data/tmp/*".to_string(),
            risk_profile: None,
            mode_used: Some(SandboxMode::Isolated),
            outcome,
            failure: None,
            diff_summary: None,
            message: None,
        }
    }

    fn chain(n: u64) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> = Vec::new();
        for seq in 0..n {
            let prev = entries.last().map(|e| e.digest.clone());
            entries.push(AuditEntry::seal(seq, record(AuditOutcome::Classified), prev).unwrap());
        }
        entries
    }

    #[test]
    fn test_digest_is_stable_through_json() {
        let entry = AuditEntry::seal(0, record(AuditOutcome::Started), None).unwrap();
        let line = serde_json::to_string(&entry).unwrap();
        let back: AuditEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back.compute_digest().unwrap(), entry.digest);
        assert_eq!(entry.digest.len(), 64);
        assert_eq!(entry.short_digest().len(), 12);
    }

    #[test]
    fn test_verify_accepts_intact_chain() {
        assert_eq!(verify_chain(&chain(3)).unwrap(), 3);
    }

    #[test]
    fn test_verify_detects_edit() {
        let mut entries = chain(3);
        entries[1].record.operation_text = "ls".to_string();
        let err = verify_chain(&entries).unwrap_err();
        assert!(matches!(err, AuditError::ChainBroken { seq: 1, .. }));
    }

    #[test]
    fn test_verify_detects_deletion() {
        let mut entries = chain(3);
        entries.remove(1);
        assert!(verify_chain(&entries).is_err());
    }

    #[test]
    fn test_flattened_json_shape() {
        let entry = AuditEntry::seal(0, record(AuditOutcome::Cancelled), None).unwrap();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["outcome"], "cancelled");
        assert_eq!(json["step_id"], 1);
        assert_eq!(json["mode_used"], "isolated");
    }
}
