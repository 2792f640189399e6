use serde::{Deserialize, Serialize};

/// Terminal status of one scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    /// Completed, but some files were skipped with recoverable errors.
    Partial,
    Failed,
}

/// Category of a per-file scan error. All but `WriteFailed` are recovered
/// locally: the file is skipped and the run continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileErrorKind {
    Unreadable,
    ParseFailed,
    Timeout,
    WriteFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub rel_path: String,
    pub kind: FileErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedOp {
    Add,
    Update,
    Delete,
}

/// One entry of a dry run's plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChange {
    pub op: PlannedOp,
    pub rel_path: String,
}

/// Per-run outcome reported back to the scheduler and the status store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub scanned: u64,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub errors: Vec<FileError>,
    pub dry_run: bool,
    /// Populated only for dry runs.
    pub planned: Vec<PlannedChange>,
    /// Set when an unrecoverable write failure aborted the run.
    pub aborted: bool,
}

impl ScanOutcome {
    pub(crate) fn record_error(&mut self, rel_path: &str, kind: FileErrorKind, detail: String) {
        self.failed += 1;
        self.errors.push(FileError {
            rel_path: rel_path.to_string(),
            kind,
            detail,
        });
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        if self.aborted {
            RunStatus::Failed
        } else if self.errors.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Partial
        }
    }

    /// Whether the run counts as a success for health and backoff purposes.
    /// Partial runs completed; only an aborted run grows the failure streak.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status() != RunStatus::Failed
    }
}
