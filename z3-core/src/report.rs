//! Per-subject outcomes and the cycle summary.

use crate::history::SyncLogEntry;
use crate::triple::ItemKey;
use std::fmt;

/// What happened to one subject during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectOutcome {
    /// Remote state applied locally at `version`.
    Applied { version: u64 },
    /// Local state pushed; the remote now holds `version`.
    Uploaded { version: u64 },
    /// Tombstoned (or physically removed when `purged`).
    Deleted { version: u64, purged: bool },
    /// Left untouched by policy; re-evaluated next cycle.
    Skipped,
    /// Could not be synced; re-evaluated next cycle.
    Failed(String),
}

impl SubjectOutcome {
    /// Whether the subject's per-item checkpoint may advance.
    pub fn is_settled(&self) -> bool {
        !matches!(self, SubjectOutcome::Skipped | SubjectOutcome::Failed(_))
    }

    /// Remote version reached by a settled subject.
    pub fn version(&self) -> Option<u64> {
        match self {
            SubjectOutcome::Applied { version }
            | SubjectOutcome::Uploaded { version }
            | SubjectOutcome::Deleted { version, .. } => Some(*version),
            SubjectOutcome::Skipped | SubjectOutcome::Failed(_) => None,
        }
    }
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub from_version: u64,
    /// Library version reached; `None` when the remote leg failed.
    pub to_version: Option<u64>,
    /// Subjects whose remote state was applied locally.
    pub synced: Vec<ItemKey>,
    /// Remote entries that matched the local state already.
    pub unchanged: usize,
    pub uploaded: Vec<ItemKey>,
    pub skipped: Vec<ItemKey>,
    pub failed: Vec<(ItemKey, String)>,
    pub deleted: Vec<ItemKey>,
    pub downloaded: Vec<ItemKey>,
    /// Failure of the remote change listing, if any.
    pub remote_error: Option<String>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn new(from_version: u64) -> Self {
        Self {
            from_version,
            ..Default::default()
        }
    }

    /// Tally `outcome` for `key`.
    pub fn record(&mut self, key: &ItemKey, outcome: &SubjectOutcome) {
        match outcome {
            SubjectOutcome::Applied { .. } => self.synced.push(key.clone()),
            SubjectOutcome::Uploaded { .. } => self.uploaded.push(key.clone()),
            SubjectOutcome::Deleted { .. } => self.deleted.push(key.clone()),
            SubjectOutcome::Skipped => self.skipped.push(key.clone()),
            SubjectOutcome::Failed(reason) => self.failed.push((key.clone(), reason.clone())),
        }
    }

    /// True when every subject synced and the remote leg succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.remote_error.is_none() && !self.cancelled
    }

    /// Single-line error summary for the sync log.
    pub fn error_summary(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(e) = &self.remote_error {
            parts.push(format!("remote: {}", e));
        }
        if !self.failed.is_empty() {
            parts.push(format!("{} subject(s) failed", self.failed.len()));
        }
        if self.cancelled {
            parts.push("cancelled".to_string());
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }

    pub fn log_entry(&self) -> SyncLogEntry {
        SyncLogEntry {
            from_version: self.from_version,
            to_version: self.to_version,
            timestamp: chrono::Utc::now().timestamp(),
            synced: self.synced.len() as u64,
            skipped: self.skipped.len() as u64,
            failed: self.failed.len() as u64,
            deleted: self.deleted.len() as u64,
            uploaded: self.uploaded.len() as u64,
            downloaded: self.downloaded.len() as u64,
            duration_ms: self.duration_ms,
            success: self.is_success(),
            error: self.error_summary(),
        }
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let to = self
            .to_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".to_string());
        write!(
            f,
            "v{} -> v{}: {} synced, {} unchanged, {} uploaded, {} deleted, {} downloaded, {} skipped, {} failed in {:.1}s",
            self.from_version,
            to,
            self.synced.len(),
            self.unchanged,
            self.uploaded.len(),
            self.deleted.len(),
            self.downloaded.len(),
            self.skipped.len(),
            self.failed.len(),
            self.duration_ms as f64 / 1000.0,
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}
