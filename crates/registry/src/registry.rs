use crate::error::{RegistryError, Result};
use crate::model::{
    normalize_path, ExecutionScope, NewRoot, Requester, RootFilter, RootId, WatchedRoot,
};
use crate::store;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

const DEFAULT_SCHEDULE_SECS: u64 = 300;
const DEFAULT_MAX_CONCURRENCY: u32 = 1;

/// Durable registry of watched roots.
///
/// All mutations run under one write lock and persist the full root set
/// atomically before returning, so concurrent registrations, transitions and
/// watermark updates serialize against each other. Reads always reflect the
/// current committed state; nothing is cached across scheduling ticks.
pub struct RootRegistry {
    state_dir: PathBuf,
    roots: RwLock<BTreeMap<RootId, WatchedRoot>>,
}

impl RootRegistry {
    /// Opens the registry at `state_dir`, loading any previously persisted
    /// roots.
    pub async fn open(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        let loaded = store::load_roots(&state_dir).await?;
        let mut roots = BTreeMap::new();
        for root in loaded {
            root.validate()?;
            roots.insert(root.root_id.clone(), root);
        }
        log::info!(
            "Opened root registry at {} ({} roots)",
            state_dir.display(),
            roots.len()
        );
        Ok(Self {
            state_dir,
            roots: RwLock::new(roots),
        })
    }

    /// Registers a new watched root on behalf of `caller`.
    ///
    /// Scope fields omitted from the request default to the caller's own
    /// scope and identity. Fails fast with [`RegistryError::DuplicateRoot`]
    /// when the scoped uniqueness constraint is violated, and with
    /// [`RegistryError::InvalidPathForScope`] when a server root's path is
    /// not accessible from the server's filesystem view.
    pub async fn register(&self, request: NewRoot, caller: &Requester) -> Result<WatchedRoot> {
        let scope = request.scope.unwrap_or(caller.scope);
        let executor_id = match scope {
            ExecutionScope::Client => request
                .executor_id
                .clone()
                .or_else(|| caller.executor_id.clone()),
            ExecutionScope::Server => None,
        };

        if scope == ExecutionScope::Server {
            verify_server_path(&request.path).await?;
        }

        let root = WatchedRoot {
            root_id: RootId::generate(),
            normalized_path: normalize_path(&request.path),
            execution_scope: scope,
            executor_id,
            schedule_secs: request.schedule_secs.unwrap_or(DEFAULT_SCHEDULE_SECS),
            enabled: true,
            paused: false,
            max_concurrency: request.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            last_scan_started_at: None,
            last_scan_completed_at: None,
            last_successful_scan_at: None,
            last_error_at: None,
            consecutive_failures: 0,
        };
        root.validate()?;

        let mut roots = self.roots.write().await;
        if roots
            .values()
            .any(|existing| same_scoped_path(existing, root.execution_scope, root.executor_id.as_deref(), &root.normalized_path))
        {
            return Err(RegistryError::DuplicateRoot {
                path: root.normalized_path,
                scope: root.execution_scope,
            });
        }

        roots.insert(root.root_id.clone(), root.clone());
        self.persist(&roots).await?;
        log::info!(
            "Registered root {} at {} ({})",
            root.root_id,
            root.normalized_path,
            root.owner()
        );
        Ok(root)
    }

    /// Returns roots matching `filter`. Filtering happens here, inside the
    /// registry; schedulers must never fetch the full set and filter locally.
    pub async fn list(&self, filter: &RootFilter) -> Vec<WatchedRoot> {
        let roots = self.roots.read().await;
        roots.values().filter(|r| filter.matches(r)).cloned().collect()
    }

    pub async fn get(&self, root_id: &RootId) -> Result<WatchedRoot> {
        let roots = self.roots.read().await;
        roots
            .get(root_id)
            .cloned()
            .ok_or_else(|| RegistryError::RootNotFound(root_id.clone()))
    }

    /// Scope Guard: checks that `requester` matches the root's recorded
    /// ownership and returns the root on success. Every scan/write entry
    /// point goes through here before touching data.
    pub async fn authorize(&self, root_id: &RootId, requester: &Requester) -> Result<WatchedRoot> {
        let root = self.get(root_id).await?;
        check_scope(&root, requester)?;
        Ok(root)
    }

    /// Moves a root between scopes in place, preserving `root_id`.
    ///
    /// `expected_owner` is the ownership the caller observed; if another
    /// transition moved the root in the meantime, this attempt loses with
    /// [`RegistryError::ScopeTransitionConflict`]. The target scope's
    /// uniqueness constraint is preflight-checked before the update commits,
    /// so concurrent transitions of the same root resolve to exactly one
    /// winner.
    pub async fn transition_scope(
        &self,
        root_id: &RootId,
        expected_owner: &Requester,
        target_scope: ExecutionScope,
        target_executor_id: Option<String>,
    ) -> Result<WatchedRoot> {
        let mut roots = self.roots.write().await;
        let current = roots
            .get(root_id)
            .cloned()
            .ok_or_else(|| RegistryError::RootNotFound(root_id.clone()))?;

        if current.execution_scope != expected_owner.scope
            || current.executor_id != expected_owner.executor_id
        {
            return Err(RegistryError::ScopeTransitionConflict {
                root_id: root_id.clone(),
                path: current.normalized_path,
            });
        }

        let target_executor_id = match target_scope {
            ExecutionScope::Client => target_executor_id,
            ExecutionScope::Server => None,
        };

        // Preflight against the target scope's uniqueness constraint.
        if roots.values().any(|existing| {
            existing.root_id != *root_id
                && same_scoped_path(
                    existing,
                    target_scope,
                    target_executor_id.as_deref(),
                    &current.normalized_path,
                )
        }) {
            return Err(RegistryError::ScopeTransitionConflict {
                root_id: root_id.clone(),
                path: current.normalized_path,
            });
        }

        let entry = roots
            .get_mut(root_id)
            .ok_or_else(|| RegistryError::RootNotFound(root_id.clone()))?;
        entry.execution_scope = target_scope;
        entry.executor_id = target_executor_id;
        entry.validate()?;
        let updated = entry.clone();
        self.persist(&roots).await?;
        log::info!(
            "Transitioned root {} to {}",
            updated.root_id,
            updated.owner()
        );
        Ok(updated)
    }

    /// Pauses or resumes scheduling for a root. Authorization-gated like
    /// every other mutation; `paused` only suppresses future scans, it never
    /// interrupts one in flight.
    pub async fn set_paused(
        &self,
        root_id: &RootId,
        requester: &Requester,
        paused: bool,
    ) -> Result<WatchedRoot> {
        self.update_authorized(root_id, requester, |root| root.paused = paused)
            .await
    }

    pub async fn set_enabled(
        &self,
        root_id: &RootId,
        requester: &Requester,
        enabled: bool,
    ) -> Result<WatchedRoot> {
        self.update_authorized(root_id, requester, |root| root.enabled = enabled)
            .await
    }

    /// Stamps `last_scan_started_at` as a scan begins.
    pub async fn mark_scan_started(
        &self,
        root_id: &RootId,
        requester: &Requester,
    ) -> Result<WatchedRoot> {
        let now = store::unix_now_ms();
        self.update_authorized(root_id, requester, |root| {
            root.last_scan_started_at = Some(now);
        })
        .await
    }

    /// Records a scan outcome: success resets the failure streak, failure
    /// grows it and stamps `last_error_at`. Both stamp completion.
    pub async fn record_outcome(
        &self,
        root_id: &RootId,
        requester: &Requester,
        success: bool,
    ) -> Result<WatchedRoot> {
        let now = store::unix_now_ms();
        self.update_authorized(root_id, requester, |root| {
            root.last_scan_completed_at = Some(now);
            if success {
                root.last_successful_scan_at = Some(now);
                root.consecutive_failures = 0;
            } else {
                root.last_error_at = Some(now);
                root.consecutive_failures = root.consecutive_failures.saturating_add(1);
            }
        })
        .await
    }

    async fn update_authorized<F>(
        &self,
        root_id: &RootId,
        requester: &Requester,
        mutate: F,
    ) -> Result<WatchedRoot>
    where
        F: FnOnce(&mut WatchedRoot),
    {
        let mut roots = self.roots.write().await;
        let root = roots
            .get_mut(root_id)
            .ok_or_else(|| RegistryError::RootNotFound(root_id.clone()))?;
        check_scope(root, requester)?;
        mutate(root);
        let updated = root.clone();
        self.persist(&roots).await?;
        Ok(updated)
    }

    async fn persist(&self, roots: &BTreeMap<RootId, WatchedRoot>) -> Result<()> {
        store::save_roots(&self.state_dir, roots.values().cloned().collect()).await
    }
}

/// Pure scope check: requester scope must equal the root's scope, and a
/// client requester must be the recorded owner.
pub(crate) fn check_scope(root: &WatchedRoot, requester: &Requester) -> Result<()> {
    let matches = requester.scope == root.execution_scope
        && match root.execution_scope {
            ExecutionScope::Server => true,
            ExecutionScope::Client => {
                requester.executor_id.is_some() && requester.executor_id == root.executor_id
            }
        };
    if matches {
        Ok(())
    } else {
        Err(RegistryError::ScopeConflict {
            root_id: root.root_id.clone(),
            owner: root.owner(),
            requester: requester.to_string(),
        })
    }
}

fn same_scoped_path(
    existing: &WatchedRoot,
    scope: ExecutionScope,
    executor_id: Option<&str>,
    path: &str,
) -> bool {
    if existing.execution_scope != scope || existing.normalized_path != path {
        return false;
    }
    match scope {
        // Server roots are unique per path alone.
        ExecutionScope::Server => true,
        // Client roots are unique per (executor, path).
        ExecutionScope::Client => existing.executor_id.as_deref() == executor_id,
    }
}

async fn verify_server_path(path: &str) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(RegistryError::InvalidPathForScope {
            scope: ExecutionScope::Server,
            reason: format!("{path} is not a directory"),
        }),
        Err(err) => Err(RegistryError::InvalidPathForScope {
            scope: ExecutionScope::Server,
            reason: format!("{path} is not accessible: {err}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn registry(dir: &TempDir) -> RootRegistry {
        RootRegistry::open(dir.path().join("state")).await.unwrap()
    }

    #[tokio::test]
    async fn register_defaults_to_caller_identity() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir).await;
        let root = reg
            .register(NewRoot::new("/data/docs"), &Requester::client("c1"))
            .await
            .unwrap();
        assert_eq!(root.execution_scope, ExecutionScope::Client);
        assert_eq!(root.executor_id.as_deref(), Some("c1"));
        assert_eq!(root.max_concurrency, 1);
    }

    #[tokio::test]
    async fn duplicate_detection_is_scoped_per_owner() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir).await;
        reg.register(NewRoot::new("/data/docs"), &Requester::client("c1"))
            .await
            .unwrap();

        // Same client, same path: duplicate.
        let err = reg
            .register(NewRoot::new("/data/docs/"), &Requester::client("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateRoot { .. }));

        // Different client, same logical path: allowed.
        reg.register(NewRoot::new("/data/docs"), &Requester::client("c2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn client_and_server_roots_coexist_at_same_path() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir).await;
        let server_dir = dir.path().join("mounted");
        tokio::fs::create_dir_all(&server_dir).await.unwrap();
        let path = server_dir.to_string_lossy().to_string();

        reg.register(NewRoot::new(&path), &Requester::client("c1"))
            .await
            .unwrap();
        reg.register(NewRoot::new(&path), &Requester::server())
            .await
            .unwrap();

        // A second server root at the same path is a duplicate.
        let err = reg
            .register(NewRoot::new(&path), &Requester::server())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateRoot { .. }));
    }

    #[tokio::test]
    async fn server_registration_fails_fast_on_inaccessible_path() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir).await;
        let err = reg
            .register(
                NewRoot::new(dir.path().join("missing").to_string_lossy().to_string()),
                &Requester::server(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPathForScope { .. }));
    }

    #[tokio::test]
    async fn authorize_rejects_every_wrong_scope_combination() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir).await;
        let server_dir = dir.path().join("srv");
        tokio::fs::create_dir_all(&server_dir).await.unwrap();

        let client_root = reg
            .register(NewRoot::new("/data/docs"), &Requester::client("c1"))
            .await
            .unwrap();
        let server_root = reg
            .register(
                NewRoot::new(server_dir.to_string_lossy().to_string()),
                &Requester::server(),
            )
            .await
            .unwrap();

        // Owner succeeds.
        reg.authorize(&client_root.root_id, &Requester::client("c1"))
            .await
            .unwrap();
        reg.authorize(&server_root.root_id, &Requester::server())
            .await
            .unwrap();

        // Wrong client.
        let err = reg
            .authorize(&client_root.root_id, &Requester::client("c2"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ScopeConflict { .. }));

        // Server acting on a client root.
        let err = reg
            .authorize(&client_root.root_id, &Requester::server())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ScopeConflict { .. }));

        // Client acting on a server root.
        let err = reg
            .authorize(&server_root.root_id, &Requester::client("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ScopeConflict { .. }));
    }

    #[tokio::test]
    async fn transition_preserves_identity_and_checks_target_uniqueness() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir).await;
        let root = reg
            .register(NewRoot::new("/data/docs"), &Requester::client("c1"))
            .await
            .unwrap();
        // c2 already owns the same logical path.
        reg.register(NewRoot::new("/data/docs"), &Requester::client("c2"))
            .await
            .unwrap();

        let err = reg
            .transition_scope(
                &root.root_id,
                &Requester::client("c1"),
                ExecutionScope::Client,
                Some("c2".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ScopeTransitionConflict { .. }));

        let moved = reg
            .transition_scope(
                &root.root_id,
                &Requester::client("c1"),
                ExecutionScope::Server,
                None,
            )
            .await
            .unwrap();
        assert_eq!(moved.root_id, root.root_id);
        assert_eq!(moved.execution_scope, ExecutionScope::Server);
        assert_eq!(moved.executor_id, None);
        moved.validate().unwrap();
    }

    #[tokio::test]
    async fn concurrent_transitions_resolve_to_one_winner() {
        let dir = TempDir::new().unwrap();
        let reg = Arc::new(registry(&dir).await);
        let root = reg
            .register(NewRoot::new("/data/docs"), &Requester::client("c1"))
            .await
            .unwrap();

        let a = {
            let reg = reg.clone();
            let id = root.root_id.clone();
            tokio::spawn(async move {
                reg.transition_scope(&id, &Requester::client("c1"), ExecutionScope::Server, None)
                    .await
            })
        };
        let b = {
            let reg = reg.clone();
            let id = root.root_id.clone();
            tokio::spawn(async move {
                reg.transition_scope(
                    &id,
                    &Requester::client("c1"),
                    ExecutionScope::Client,
                    Some("c2".to_string()),
                )
                .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(RegistryError::ScopeTransitionConflict { .. })
                )
            })
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn outcome_bookkeeping_updates_streak_and_watermarks() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir).await;
        let requester = Requester::client("c1");
        let root = reg
            .register(NewRoot::new("/data/docs"), &requester)
            .await
            .unwrap();

        reg.mark_scan_started(&root.root_id, &requester).await.unwrap();
        let failed = reg
            .record_outcome(&root.root_id, &requester, false)
            .await
            .unwrap();
        assert_eq!(failed.consecutive_failures, 1);
        assert!(failed.last_error_at.is_some());

        let ok = reg
            .record_outcome(&root.root_id, &requester, true)
            .await
            .unwrap();
        assert_eq!(ok.consecutive_failures, 0);
        assert!(ok.last_successful_scan_at.is_some());
    }

    #[tokio::test]
    async fn registry_reloads_persisted_roots() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("state");
        let root_id = {
            let reg = RootRegistry::open(&state_dir).await.unwrap();
            reg.register(NewRoot::new("/data/docs"), &Requester::client("c1"))
                .await
                .unwrap()
                .root_id
        };

        let reopened = RootRegistry::open(&state_dir).await.unwrap();
        let root = reopened.get(&root_id).await.unwrap();
        assert_eq!(root.normalized_path, "/data/docs");
        assert_eq!(root.executor_id.as_deref(), Some("c1"));
    }
}
