use crate::run::{IndexingRun, RunId};
use crate::scheduler::next_due_ms;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::watch;
use watchdex_registry::{RootId, WatchedRoot};
use watchdex_scanner::RunStatus;

const HEALTH_FILE_NAME: &str = "health.json";
const MAX_RETAINED_RUNS: usize = 200;

/// Per-root scheduling state. `paused` is orthogonal and lives on the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootState {
    Idle,
    Running,
    Degraded,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub completed_at_ms: Option<u64>,
    pub error_count: usize,
    pub dry_run: bool,
}

/// Health of one root, as reported to status queries and persisted for
/// external tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootHealth {
    pub root_id: RootId,
    pub state: RootState,
    pub paused: bool,
    pub consecutive_failures: u32,
    pub next_attempt_at_ms: Option<u64>,
    pub last_run: Option<RunSummary>,
}

impl RootHealth {
    fn initial(root_id: RootId) -> Self {
        Self {
            root_id,
            state: RootState::Idle,
            paused: false,
            consecutive_failures: 0,
            next_attempt_at_ms: None,
            last_run: None,
        }
    }
}

struct Inner {
    health: BTreeMap<RootId, RootHealth>,
    runs: VecDeque<IndexingRun>,
}

/// Records run outcomes and per-root health for external reporting.
///
/// Escalation from `Degraded` to `Error` is a status transition made here,
/// never an error path: a root whose failure streak reaches the threshold is
/// reported as `Error` and keeps backing off, while one subsequent success
/// resets it to `Idle`.
pub struct StatusStore {
    state_dir: PathBuf,
    failure_threshold: u32,
    inner: Mutex<Inner>,
    health_tx: watch::Sender<Vec<RootHealth>>,
}

impl StatusStore {
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>, failure_threshold: u32) -> Self {
        let (health_tx, _) = watch::channel(Vec::new());
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            failure_threshold,
            inner: Mutex::new(Inner {
                health: BTreeMap::new(),
                runs: VecDeque::new(),
            }),
            health_tx,
        }
    }

    /// Marks a root's run in flight.
    pub fn run_started(&self, run: &IndexingRun) {
        let mut inner = self.inner.lock().expect("status store poisoned");
        let entry = inner
            .health
            .entry(run.root_id.clone())
            .or_insert_with(|| RootHealth::initial(run.root_id.clone()));
        entry.state = RootState::Running;
        let snapshot = snapshot_of(&inner);
        drop(inner);
        let _ = self.health_tx.send(snapshot);
    }

    /// Records a completed run and recomputes the root's health from the
    /// post-run registry row. Persists the health snapshot to the state dir.
    pub async fn run_completed(&self, run: IndexingRun, root: &WatchedRoot) -> Result<()> {
        debug_assert!(run.completed_at_ms.is_some());
        let state = if run.status == RunStatus::Running {
            RootState::Running
        } else if root.consecutive_failures == 0 {
            RootState::Idle
        } else if root.consecutive_failures < self.failure_threshold {
            RootState::Degraded
        } else {
            RootState::Error
        };

        let snapshot = {
            let mut inner = self.inner.lock().expect("status store poisoned");
            let summary = RunSummary {
                run_id: run.run_id.clone(),
                status: run.status,
                completed_at_ms: run.completed_at_ms,
                error_count: run
                    .outcome
                    .as_ref()
                    .map(|o| o.errors.len())
                    .unwrap_or(usize::from(run.error.is_some())),
                dry_run: run.dry_run,
            };
            let entry = inner
                .health
                .entry(run.root_id.clone())
                .or_insert_with(|| RootHealth::initial(run.root_id.clone()));
            entry.state = state;
            entry.paused = root.paused;
            entry.consecutive_failures = root.consecutive_failures;
            entry.next_attempt_at_ms = Some(next_due_ms(root));
            entry.last_run = Some(summary);

            inner.runs.push_back(run);
            if inner.runs.len() > MAX_RETAINED_RUNS {
                inner.runs.pop_front();
            }
            snapshot_of(&inner)
        };

        let _ = self.health_tx.send(snapshot.clone());
        self.persist(&snapshot).await
    }

    /// Reflects a pause/resume decision immediately, without waiting for the
    /// next run to complete.
    pub fn set_paused(&self, root: &WatchedRoot) {
        let mut inner = self.inner.lock().expect("status store poisoned");
        let entry = inner
            .health
            .entry(root.root_id.clone())
            .or_insert_with(|| RootHealth::initial(root.root_id.clone()));
        entry.paused = root.paused;
        let snapshot = snapshot_of(&inner);
        drop(inner);
        let _ = self.health_tx.send(snapshot);
    }

    #[must_use]
    pub fn health_of(&self, root_id: &RootId) -> Option<RootHealth> {
        let inner = self.inner.lock().expect("status store poisoned");
        inner.health.get(root_id).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<RootHealth> {
        let inner = self.inner.lock().expect("status store poisoned");
        snapshot_of(&inner)
    }

    /// Most recent runs for a root, newest first.
    #[must_use]
    pub fn recent_runs(&self, root_id: &RootId, limit: usize) -> Vec<IndexingRun> {
        let inner = self.inner.lock().expect("status store poisoned");
        inner
            .runs
            .iter()
            .rev()
            .filter(|run| run.root_id == *root_id)
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<RootHealth>> {
        self.health_tx.subscribe()
    }

    async fn persist(&self, snapshot: &[RootHealth]) -> Result<()> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let path = self.state_dir.join(HEALTH_FILE_NAME);
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn snapshot_of(inner: &Inner) -> Vec<RootHealth> {
    inner.health.values().cloned().collect()
}

/// Reads the last persisted health snapshot. This is the out-of-process view:
/// admin tooling reports from the file a running scheduler left behind.
pub async fn load_health_snapshot(state_dir: impl AsRef<Path>) -> Result<Vec<RootHealth>> {
    let path = state_dir.as_ref().join(HEALTH_FILE_NAME);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use watchdex_registry::ExecutionScope;
    use watchdex_scanner::ScanOutcome;

    fn sample_root() -> WatchedRoot {
        WatchedRoot {
            root_id: RootId::from("r1"),
            normalized_path: "/data/docs".to_string(),
            execution_scope: ExecutionScope::Client,
            executor_id: Some("c1".to_string()),
            schedule_secs: 300,
            enabled: true,
            paused: false,
            max_concurrency: 1,
            last_scan_started_at: Some(1_000_000),
            last_scan_completed_at: Some(1_000_000),
            last_successful_scan_at: Some(1_000_000),
            last_error_at: None,
            consecutive_failures: 0,
        }
    }

    #[tokio::test]
    async fn completed_run_is_visible_out_of_process() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::new(dir.path(), 5);
        let root = sample_root();

        let run = IndexingRun::started(&root, false);
        store.run_started(&run);
        assert_eq!(store.health_of(&root.root_id).unwrap().state, RootState::Running);

        store
            .run_completed(run.completed_with(ScanOutcome::default()), &root)
            .await
            .unwrap();

        let snapshot = load_health_snapshot(dir.path()).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state, RootState::Idle);
        assert_eq!(snapshot[0].last_run.as_ref().unwrap().status, RunStatus::Success);
    }

    #[tokio::test]
    async fn empty_state_dir_reads_as_no_health() {
        let dir = TempDir::new().unwrap();
        assert!(load_health_snapshot(dir.path()).await.unwrap().is_empty());
    }
}
