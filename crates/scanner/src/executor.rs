use crate::error::{Result, ScannerError};
use crate::outcome::{FileErrorKind, PlannedChange, PlannedOp, ScanOutcome};
use crate::scan_state::ScanState;
use crate::scanner::FileScanner;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use watchdex_registry::WatchedRoot;

/// A recoverable or fatal failure reported by the indexing collaborator for
/// one file.
#[derive(Debug, Clone)]
pub struct IndexerFailure {
    pub kind: FileErrorKind,
    pub detail: String,
}

impl IndexerFailure {
    #[must_use]
    pub fn parse(detail: impl Into<String>) -> Self {
        Self {
            kind: FileErrorKind::ParseFailed,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn write(detail: impl Into<String>) -> Self {
        Self {
            kind: FileErrorKind::WriteFailed,
            detail: detail.into(),
        }
    }
}

/// Seam to the external indexing engine. The coordinator never talks to the
/// vector datastore directly; adds, updates and deletes flow through here.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn upsert(&self, root: &Path, rel_path: &str)
        -> std::result::Result<(), IndexerFailure>;
    async fn remove(&self, root: &Path, rel_path: &str)
        -> std::result::Result<(), IndexerFailure>;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-file dispatch budget; an overrun is recorded as a timeout error
    /// and the file is skipped.
    pub file_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            file_timeout: Duration::from_secs(60),
        }
    }
}

/// Executes one scan of one root: walk, content-hash diff against the
/// persisted baseline, then dispatch through the [`Indexer`].
///
/// The walk and hashing run on the blocking pool; callers typically wrap
/// [`ScanExecutor::execute`] in `tokio::spawn` so an in-flight scan never
/// delays scheduling decisions or status reads for other roots.
pub struct ScanExecutor {
    state_dir: PathBuf,
    indexer: Arc<dyn Indexer>,
    config: ExecutorConfig,
}

impl ScanExecutor {
    pub fn new(
        state_dir: impl AsRef<Path>,
        indexer: Arc<dyn Indexer>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            indexer,
            config,
        }
    }

    pub async fn execute(&self, root: &WatchedRoot, dry_run: bool) -> Result<ScanOutcome> {
        let root_path = PathBuf::from(&root.normalized_path);
        if !root_path.is_dir() {
            return Err(ScannerError::InvalidRoot(format!(
                "{} is not a directory",
                root_path.display()
            )));
        }

        let previous = ScanState::load(&self.state_dir, root.root_id.as_str()).await?;

        let walk_root = root_path.clone();
        let (current, unreadable) = tokio::task::spawn_blocking(move || walk_and_hash(&walk_root))
            .await
            .map_err(|e| ScannerError::TaskFailed(e.to_string()))?;

        let mut outcome = ScanOutcome {
            scanned: (current.len() + unreadable.len()) as u64,
            dry_run,
            ..ScanOutcome::default()
        };
        let unreadable_paths: BTreeSet<String> =
            unreadable.iter().map(|(rel, _)| rel.clone()).collect();
        for (rel_path, detail) in unreadable {
            outcome.record_error(&rel_path, FileErrorKind::Unreadable, detail);
        }

        let mut adds = Vec::new();
        let mut updates = Vec::new();
        for (rel_path, hash) in &current {
            match previous.hashes.get(rel_path) {
                None => adds.push(rel_path.clone()),
                Some(prev_hash) if prev_hash != hash => updates.push(rel_path.clone()),
                Some(_) => outcome.skipped += 1,
            }
        }
        // A known file that turned unreadable is reported, not deleted: its
        // baseline entry stays, so a transient read failure never tears down
        // the indexed document.
        let deletes: Vec<String> = previous
            .hashes
            .keys()
            .filter(|rel| !current.contains_key(*rel) && !unreadable_paths.contains(*rel))
            .cloned()
            .collect();

        if dry_run {
            outcome.planned = plan(&adds, &updates, &deletes);
            log::info!(
                "Dry run for root {}: {} adds, {} updates, {} deletes",
                root.root_id,
                adds.len(),
                updates.len(),
                deletes.len()
            );
            return Ok(outcome);
        }

        let mut state = previous;
        for rel_path in adds.iter().chain(updates.iter()) {
            let is_add = !state.hashes.contains_key(rel_path);
            match self.dispatch_upsert(&root_path, rel_path).await {
                Ok(()) => {
                    if is_add {
                        outcome.added += 1;
                    } else {
                        outcome.updated += 1;
                    }
                    let hash = current
                        .get(rel_path)
                        .cloned()
                        .unwrap_or_default();
                    state.hashes.insert(rel_path.clone(), hash);
                }
                Err(failure) => {
                    let fatal = failure.kind == FileErrorKind::WriteFailed;
                    outcome.record_error(rel_path, failure.kind, failure.detail);
                    if fatal {
                        outcome.aborted = true;
                        break;
                    }
                }
            }
        }

        if !outcome.aborted {
            for rel_path in &deletes {
                match self.dispatch_remove(&root_path, rel_path).await {
                    Ok(()) => {
                        outcome.deleted += 1;
                        state.hashes.remove(rel_path);
                    }
                    Err(failure) => {
                        let fatal = failure.kind == FileErrorKind::WriteFailed;
                        outcome.record_error(rel_path, failure.kind, failure.detail);
                        if fatal {
                            outcome.aborted = true;
                            break;
                        }
                    }
                }
            }
        }

        // Persist whatever progress committed; the content-hash baseline
        // makes any replay after an abort idempotent.
        state.save(&self.state_dir, root.root_id.as_str()).await?;

        log::info!(
            "Scan of root {} finished: +{} ~{} -{} (skipped {}, failed {})",
            root.root_id,
            outcome.added,
            outcome.updated,
            outcome.deleted,
            outcome.skipped,
            outcome.failed
        );
        Ok(outcome)
    }

    async fn dispatch_upsert(
        &self,
        root_path: &Path,
        rel_path: &str,
    ) -> std::result::Result<(), IndexerFailure> {
        match tokio::time::timeout(
            self.config.file_timeout,
            self.indexer.upsert(root_path, rel_path),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(IndexerFailure {
                kind: FileErrorKind::Timeout,
                detail: format!("upsert exceeded {}s", self.config.file_timeout.as_secs()),
            }),
        }
    }

    async fn dispatch_remove(
        &self,
        root_path: &Path,
        rel_path: &str,
    ) -> std::result::Result<(), IndexerFailure> {
        match tokio::time::timeout(
            self.config.file_timeout,
            self.indexer.remove(root_path, rel_path),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(IndexerFailure {
                kind: FileErrorKind::Timeout,
                detail: format!("remove exceeded {}s", self.config.file_timeout.as_secs()),
            }),
        }
    }
}

fn plan(adds: &[String], updates: &[String], deletes: &[String]) -> Vec<PlannedChange> {
    let mut planned = Vec::with_capacity(adds.len() + updates.len() + deletes.len());
    for rel_path in adds {
        planned.push(PlannedChange {
            op: PlannedOp::Add,
            rel_path: rel_path.clone(),
        });
    }
    for rel_path in updates {
        planned.push(PlannedChange {
            op: PlannedOp::Update,
            rel_path: rel_path.clone(),
        });
    }
    for rel_path in deletes {
        planned.push(PlannedChange {
            op: PlannedOp::Delete,
            rel_path: rel_path.clone(),
        });
    }
    planned
}

/// Blocking walk + SHA-256 pass. Returns the live content map and the files
/// that could not be read.
fn walk_and_hash(root: &Path) -> (BTreeMap<String, String>, Vec<(String, String)>) {
    let mut hashes = BTreeMap::new();
    let mut unreadable = Vec::new();

    for path in FileScanner::new(root).scan() {
        let rel_path = normalize_rel(root, &path);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                hashes.insert(rel_path, format!("{:x}", hasher.finalize()));
            }
            Err(err) => unreadable.push((rel_path, err.to_string())),
        }
    }

    (hashes, unreadable)
}

fn normalize_rel(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut normalized = relative.to_string_lossy().to_string();
    if normalized.contains('\\') {
        normalized = normalized.replace('\\', "/");
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::RunStatus;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use watchdex_registry::{ExecutionScope, RootId, WatchedRoot};

    #[derive(Default)]
    struct MockIndexer {
        failures: Mutex<HashMap<String, FileErrorKind>>,
        upserts: Mutex<Vec<String>>,
        removes: Mutex<Vec<String>>,
    }

    impl MockIndexer {
        fn fail(&self, rel_path: &str, kind: FileErrorKind) {
            self.failures
                .lock()
                .unwrap()
                .insert(rel_path.to_string(), kind);
        }

        fn failure_for(&self, rel_path: &str) -> Option<IndexerFailure> {
            self.failures
                .lock()
                .unwrap()
                .get(rel_path)
                .map(|kind| IndexerFailure {
                    kind: *kind,
                    detail: format!("injected {kind:?}"),
                })
        }
    }

    #[async_trait]
    impl Indexer for MockIndexer {
        async fn upsert(
            &self,
            _root: &Path,
            rel_path: &str,
        ) -> std::result::Result<(), IndexerFailure> {
            if let Some(failure) = self.failure_for(rel_path) {
                return Err(failure);
            }
            self.upserts.lock().unwrap().push(rel_path.to_string());
            Ok(())
        }

        async fn remove(
            &self,
            _root: &Path,
            rel_path: &str,
        ) -> std::result::Result<(), IndexerFailure> {
            if let Some(failure) = self.failure_for(rel_path) {
                return Err(failure);
            }
            self.removes.lock().unwrap().push(rel_path.to_string());
            Ok(())
        }
    }

    fn root_for(dir: &Path) -> WatchedRoot {
        WatchedRoot {
            root_id: RootId::from("r1"),
            normalized_path: dir.to_string_lossy().to_string(),
            execution_scope: ExecutionScope::Server,
            executor_id: None,
            schedule_secs: 60,
            enabled: true,
            paused: false,
            max_concurrency: 1,
            last_scan_started_at: None,
            last_scan_completed_at: None,
            last_successful_scan_at: None,
            last_error_at: None,
            consecutive_failures: 0,
        }
    }

    fn harness(dir: &TempDir) -> (ScanExecutor, Arc<MockIndexer>, WatchedRoot, PathBuf) {
        let docs = dir.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        let indexer = Arc::new(MockIndexer::default());
        let executor = ScanExecutor::new(
            dir.path().join("state"),
            indexer.clone(),
            ExecutorConfig::default(),
        );
        let root = root_for(&docs);
        (executor, indexer, root, docs)
    }

    #[tokio::test]
    async fn first_scan_adds_then_steady_state_skips() {
        let dir = TempDir::new().unwrap();
        let (executor, indexer, root, docs) = harness(&dir);
        std::fs::write(docs.join("a.md"), b"alpha").unwrap();
        std::fs::write(docs.join("b.md"), b"beta").unwrap();

        let first = executor.execute(&root, false).await.unwrap();
        assert_eq!(first.added, 2);
        assert_eq!(first.status(), RunStatus::Success);
        assert_eq!(indexer.upserts.lock().unwrap().len(), 2);

        let second = executor.execute(&root, false).await.unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(indexer.upserts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn content_change_and_delete_are_dispatched() {
        let dir = TempDir::new().unwrap();
        let (executor, indexer, root, docs) = harness(&dir);
        std::fs::write(docs.join("a.md"), b"alpha").unwrap();
        std::fs::write(docs.join("b.md"), b"beta").unwrap();
        executor.execute(&root, false).await.unwrap();

        std::fs::write(docs.join("a.md"), b"alpha v2").unwrap();
        std::fs::remove_file(docs.join("b.md")).unwrap();

        let outcome = executor.execute(&root, false).await.unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.deleted, 1);
        assert_eq!(indexer.removes.lock().unwrap().as_slice(), &["b.md"]);
    }

    #[tokio::test]
    async fn touched_but_unchanged_content_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (executor, _indexer, root, docs) = harness(&dir);
        std::fs::write(docs.join("a.md"), b"alpha").unwrap();
        executor.execute(&root, false).await.unwrap();

        // Rewrite identical bytes; mtime moves but the hash does not.
        std::fs::write(docs.join("a.md"), b"alpha").unwrap();
        let outcome = executor.execute(&root, false).await.unwrap();
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.skipped, 1);
    }

    #[tokio::test]
    async fn dry_run_plans_without_mutating() {
        let dir = TempDir::new().unwrap();
        let (executor, indexer, root, docs) = harness(&dir);
        std::fs::write(docs.join("a.md"), b"alpha").unwrap();

        let outcome = executor.execute(&root, true).await.unwrap();
        assert!(outcome.dry_run);
        assert_eq!(
            outcome.planned,
            vec![PlannedChange {
                op: PlannedOp::Add,
                rel_path: "a.md".to_string()
            }]
        );
        assert!(indexer.upserts.lock().unwrap().is_empty());

        // Nothing was committed: the real run still sees an add.
        let real = executor.execute(&root, false).await.unwrap();
        assert_eq!(real.added, 1);
    }

    #[tokio::test]
    async fn parse_failure_skips_file_and_run_continues() {
        let dir = TempDir::new().unwrap();
        let (executor, indexer, root, docs) = harness(&dir);
        std::fs::write(docs.join("bad.bin"), b"\x00\x01").unwrap();
        std::fs::write(docs.join("good.md"), b"fine").unwrap();
        indexer.fail("bad.bin", FileErrorKind::ParseFailed);

        let outcome = executor.execute(&root, false).await.unwrap();
        assert_eq!(outcome.status(), RunStatus::Partial);
        assert!(outcome.succeeded());
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.errors[0].kind, FileErrorKind::ParseFailed);

        // The failed file stays out of the baseline and is retried.
        let state = ScanState::load(&dir.path().join("state"), "r1")
            .await
            .unwrap();
        assert!(!state.hashes.contains_key("bad.bin"));
        assert!(state.hashes.contains_key("good.md"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_known_file_is_reported_not_deleted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let (executor, indexer, root, docs) = harness(&dir);
        std::fs::write(docs.join("a.md"), b"alpha").unwrap();
        executor.execute(&root, false).await.unwrap();

        let path = docs.join("a.md");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).unwrap();
        if std::fs::read(&path).is_ok() {
            // A privileged test runner can read the file regardless of its
            // mode; there is nothing to observe then.
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
            return;
        }

        let outcome = executor.execute(&root, false).await.unwrap();
        assert_eq!(outcome.errors[0].kind, FileErrorKind::Unreadable);
        assert_eq!(outcome.status(), RunStatus::Partial);
        assert_eq!(outcome.deleted, 0);
        assert!(indexer.removes.lock().unwrap().is_empty());

        // The baseline still carries the file; a later readable rescan
        // resumes from the known hash instead of re-adding from scratch.
        let state = ScanState::load(&dir.path().join("state"), "r1")
            .await
            .unwrap();
        assert!(state.hashes.contains_key("a.md"));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
    }

    #[tokio::test]
    async fn write_failure_aborts_the_run() {
        let dir = TempDir::new().unwrap();
        let (executor, indexer, root, docs) = harness(&dir);
        std::fs::write(docs.join("a.md"), b"alpha").unwrap();
        indexer.fail("a.md", FileErrorKind::WriteFailed);

        let outcome = executor.execute(&root, false).await.unwrap();
        assert!(outcome.aborted);
        assert_eq!(outcome.status(), RunStatus::Failed);
        assert!(!outcome.succeeded());
    }
}
