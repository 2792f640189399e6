use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use watchdex_registry::{unix_now_ms, ExecutionScope, RootId, WatchedRoot};
use watchdex_scanner::{RunStatus, ScanOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One execution of a scan against one root. Created at scan start, mutated
/// only by the executing scheduler instance, immutable once completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingRun {
    pub run_id: RunId,
    pub root_id: RootId,
    pub executor_scope: ExecutionScope,
    pub executor_id: Option<String>,
    pub started_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub status: RunStatus,
    pub outcome: Option<ScanOutcome>,
    /// Infrastructure failure detail when the run never produced an outcome.
    pub error: Option<String>,
    pub dry_run: bool,
}

impl IndexingRun {
    #[must_use]
    pub fn started(root: &WatchedRoot, dry_run: bool) -> Self {
        Self {
            run_id: RunId::generate(),
            root_id: root.root_id.clone(),
            executor_scope: root.execution_scope,
            executor_id: root.executor_id.clone(),
            started_at_ms: unix_now_ms(),
            completed_at_ms: None,
            status: RunStatus::Running,
            outcome: None,
            error: None,
            dry_run,
        }
    }

    #[must_use]
    pub fn completed_with(mut self, outcome: ScanOutcome) -> Self {
        self.status = outcome.status();
        self.outcome = Some(outcome);
        self.completed_at_ms = Some(unix_now_ms());
        self
    }

    #[must_use]
    pub fn failed_with(mut self, error: impl Into<String>) -> Self {
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.completed_at_ms = Some(unix_now_ms());
        self
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self.status, RunStatus::Success | RunStatus::Partial)
    }
}
