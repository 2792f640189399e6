use crate::error::{LockError, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Chosen to exceed the expected duration of a single-file indexing pass
/// while bounding how long a crashed holder can orphan a target.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10 * 60);

const LOCKS_FILE_NAME: &str = "locks.json";
const LOCKS_GUARD_FILE_NAME: &str = "locks.lock";

/// Identity of an indexing target.
///
/// The composite form is the current keying scheme. The bare-source form is
/// the legacy scheme kept through a compatibility window; both encode to one
/// canonical string, so a reader on either scheme observes a writer on the
/// other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockKey {
    Target { root_id: String, rel_path: String },
    Source { source: String },
}

impl LockKey {
    #[must_use]
    pub fn target(root_id: impl Into<String>, rel_path: impl Into<String>) -> Self {
        Self::Target {
            root_id: root_id.into(),
            rel_path: rel_path.into(),
        }
    }

    #[must_use]
    pub fn source(source: impl Into<String>) -> Self {
        Self::Source {
            source: source.into(),
        }
    }

    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Target { root_id, rel_path } => format!("root/{root_id}#{rel_path}"),
            Self::Source { source } => format!("src/{source}"),
        }
    }
}

/// A time-bounded exclusive claim over an indexing target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLock {
    pub key: LockKey,
    pub holder_id: String,
    pub acquired_at_ms: u64,
    pub ttl_ms: u64,
    token_id: String,
}

impl DocumentLock {
    #[must_use]
    pub fn expires_at_ms(&self) -> u64 {
        self.acquired_at_ms.saturating_add(self.ttl_ms)
    }

    /// Pure function of `acquired_at + ttl` against `now`; no clock is read
    /// here so expiry is decidable for any observation point.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }
}

/// Proof of a successful acquisition; required to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    canonical_key: String,
    token_id: String,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub default_ttl: Duration,
    /// Compatibility window for the legacy bare-source keying scheme.
    pub legacy_source_keys: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_LOCK_TTL,
            legacy_source_keys: false,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedLocks {
    #[serde(default)]
    locks: HashMap<String, DocumentLock>,
}

/// Grants and releases TTL-bound exclusive locks.
///
/// The lock table lives in the shared state dir, so every process working
/// against the same state (scheduler loops, one-shot admin scans) contends
/// on one lock space, and a crashed holder's entry lingers until its TTL
/// passes. Each mutation runs under an exclusive advisory lock on a sidecar
/// file: the check-and-insert is atomic across processes as well as threads,
/// so of two racing callers on the same key exactly one wins and the other
/// observes [`LockError::LockHeld`] with the incumbent's remaining window.
pub struct LockManager {
    config: LockConfig,
    state_dir: PathBuf,
}

impl LockManager {
    #[must_use]
    pub fn open(state_dir: impl AsRef<Path>, config: LockConfig) -> Self {
        Self {
            config,
            state_dir: state_dir.as_ref().to_path_buf(),
        }
    }

    pub fn acquire(
        &self,
        key: &LockKey,
        holder_id: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<LockToken> {
        if matches!(key, LockKey::Source { .. }) && !self.config.legacy_source_keys {
            return Err(LockError::LegacyKeysDisabled);
        }

        let holder_id = holder_id.into();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let canonical = key.canonical();

        self.mutate(|locks| {
            let now_ms = unix_now_ms();
            if let Some(existing) = locks.get(&canonical) {
                if !existing.is_expired(now_ms) {
                    return Err(LockError::LockHeld {
                        holder_id: existing.holder_id.clone(),
                        expires_in: Duration::from_millis(existing.expires_at_ms() - now_ms),
                    });
                }
                log::debug!(
                    "Lock {canonical} expired (holder {}); treating as absent",
                    existing.holder_id
                );
            }

            let token_id = Uuid::new_v4().to_string();
            locks.insert(
                canonical.clone(),
                DocumentLock {
                    key: key.clone(),
                    holder_id,
                    acquired_at_ms: now_ms,
                    ttl_ms: ttl.as_millis() as u64,
                    token_id: token_id.clone(),
                },
            );
            Ok(LockToken {
                canonical_key: canonical.clone(),
                token_id,
            })
        })
    }

    /// Claims one of a root's scan slots. `slots` is the root's concurrency
    /// cap: each slot is an independent key, so up to `slots` scans of one
    /// root may run at once while the next claimant observes [`LockError::LockHeld`].
    pub fn acquire_slot(
        &self,
        root_id: &str,
        slots: u32,
        holder_id: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<LockToken> {
        let holder_id = holder_id.into();
        let slots = slots.max(1);
        for slot in 0..slots - 1 {
            let key = LockKey::target(root_id, format!("slot/{slot}"));
            match self.acquire(&key, holder_id.clone(), ttl) {
                Ok(token) => return Ok(token),
                Err(LockError::LockHeld { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        let last = LockKey::target(root_id, format!("slot/{}", slots - 1));
        self.acquire(&last, holder_id, ttl)
    }

    /// Idempotent: releasing an expired, replaced, or already-released token
    /// is a no-op, never an error. Table IO failures are logged, not raised;
    /// a lock that could not be removed ages out on its own.
    pub fn release(&self, token: &LockToken) {
        let result = self.mutate(|locks| {
            if let Some(existing) = locks.get(&token.canonical_key) {
                if existing.token_id == token.token_id {
                    locks.remove(&token.canonical_key);
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            log::warn!("Failed to release lock {}: {err}", token.canonical_key);
        }
    }

    /// Current unexpired holder of `key`, if any.
    #[must_use]
    pub fn holder(&self, key: &LockKey) -> Option<DocumentLock> {
        let now_ms = unix_now_ms();
        match self.load_table() {
            Ok(locks) => locks
                .get(&key.canonical())
                .filter(|lock| !lock.is_expired(now_ms))
                .cloned(),
            Err(err) => {
                log::warn!("Failed to read lock table: {err}");
                None
            }
        }
    }

    /// Loads, mutates, and rewrites the table while holding the sidecar
    /// advisory lock. Dropping the guard file releases it.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut HashMap<String, DocumentLock>) -> Result<T>,
    ) -> Result<T> {
        std::fs::create_dir_all(&self.state_dir)?;
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.state_dir.join(LOCKS_GUARD_FILE_NAME))?;
        guard.lock_exclusive()?;

        let mut locks = self.load_table()?;
        let result = op(&mut locks);
        if result.is_ok() {
            self.save_table(locks)?;
        }
        drop(guard);
        result
    }

    fn load_table(&self) -> Result<HashMap<String, DocumentLock>> {
        let path = self.state_dir.join(LOCKS_FILE_NAME);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let persisted: PersistedLocks = serde_json::from_slice(&bytes)?;
                Ok(persisted.locks)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomic tmp + rename write, so lock-free readers never observe a
    /// truncated table.
    fn save_table(&self, locks: HashMap<String, DocumentLock>) -> Result<()> {
        let path = self.state_dir.join(LOCKS_FILE_NAME);
        let bytes = serde_json::to_vec_pretty(&PersistedLocks { locks })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LockManager {
        LockManager::open(dir.path(), LockConfig::default())
    }

    #[test]
    fn acquire_then_conflict_then_release() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let key = LockKey::target("r1", "docs/a.md");

        let token = mgr.acquire(&key, "c1", None).unwrap();
        let err = mgr.acquire(&key, "c2", None).unwrap_err();
        match err {
            LockError::LockHeld {
                holder_id,
                expires_in,
            } => {
                assert_eq!(holder_id, "c1");
                assert!(expires_in <= DEFAULT_LOCK_TTL);
            }
            other => panic!("expected LockHeld, got {other}"),
        }

        mgr.release(&token);
        mgr.acquire(&key, "c2", None).unwrap();
    }

    #[test]
    fn release_is_idempotent_and_token_scoped() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let key = LockKey::target("r1", "docs/a.md");

        let first = mgr.acquire(&key, "c1", None).unwrap();
        mgr.release(&first);
        mgr.release(&first);

        let second = mgr.acquire(&key, "c2", None).unwrap();
        // A stale token from an earlier incarnation must not free the
        // current holder's lock.
        mgr.release(&first);
        assert_eq!(mgr.holder(&key).unwrap().holder_id, "c2");
        mgr.release(&second);
        assert!(mgr.holder(&key).is_none());
    }

    #[test]
    fn expired_lock_is_absent_to_the_next_acquirer() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let key = LockKey::target("r1", "docs/a.md");

        mgr.acquire(&key, "c1", Some(Duration::from_millis(30)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(80));
        // No release ever happened; expiry alone recovers the target.
        let token = mgr.acquire(&key, "c2", None).unwrap();
        assert_eq!(mgr.holder(&key).unwrap().holder_id, "c2");
        mgr.release(&token);
    }

    #[test]
    fn lock_table_is_shared_across_manager_instances() {
        let dir = TempDir::new().unwrap();
        let key = LockKey::target("r1", "slot/0");
        // Two managers over one state dir model two processes: a running
        // scheduler and a one-shot admin scan.
        let scheduler_side = manager(&dir);
        let admin_side = manager(&dir);

        let token = scheduler_side.acquire(&key, "server", None).unwrap();
        let err = admin_side.acquire(&key, "client c1", None).unwrap_err();
        assert!(matches!(err, LockError::LockHeld { .. }));
        assert_eq!(admin_side.holder(&key).unwrap().holder_id, "server");

        // The table survives the holding manager instance; only TTL or an
        // explicit release recovers the target.
        drop(scheduler_side);
        let late = manager(&dir);
        assert!(late.acquire(&key, "client c1", None).is_err());

        late.release(&token);
        admin_side.acquire(&key, "client c1", None).unwrap();
    }

    #[test]
    fn is_expired_is_pure_in_observation_time() {
        let lock = DocumentLock {
            key: LockKey::target("r1", "a"),
            holder_id: "c1".to_string(),
            acquired_at_ms: 1_000,
            ttl_ms: 500,
            token_id: "t".to_string(),
        };
        assert!(!lock.is_expired(1_499));
        assert!(lock.is_expired(1_500));
        assert!(lock.is_expired(2_000));
    }

    #[test]
    fn racing_acquirers_produce_exactly_one_winner() {
        let dir = TempDir::new().unwrap();
        let mgr = Arc::new(manager(&dir));
        let key = LockKey::target("r1", "docs/a.md");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mgr = mgr.clone();
                let key = key.clone();
                std::thread::spawn(move || mgr.acquire(&key, format!("c{i}"), None).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn slots_cap_concurrent_claims_per_root() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let first = mgr.acquire_slot("r1", 2, "c1", None).unwrap();
        let _second = mgr.acquire_slot("r1", 2, "c1", None).unwrap();
        let err = mgr.acquire_slot("r1", 2, "c1", None).unwrap_err();
        assert!(matches!(err, LockError::LockHeld { .. }));

        // Another root's slots are independent.
        mgr.acquire_slot("r2", 2, "c1", None).unwrap();

        mgr.release(&first);
        mgr.acquire_slot("r1", 2, "c1", None).unwrap();
    }

    #[test]
    fn legacy_source_keys_are_flag_gated() {
        let dir = TempDir::new().unwrap();
        let strict = manager(&dir);
        let err = strict
            .acquire(&LockKey::source("file:///a.md"), "c1", None)
            .unwrap_err();
        assert!(matches!(err, LockError::LegacyKeysDisabled));

        let compat = LockManager::open(
            dir.path(),
            LockConfig {
                legacy_source_keys: true,
                ..LockConfig::default()
            },
        );
        compat
            .acquire(&LockKey::source("file:///a.md"), "c1", None)
            .unwrap();
    }

    #[test]
    fn canonical_forms_do_not_collide_across_schemes() {
        let composite = LockKey::target("r1", "a.md").canonical();
        let legacy = LockKey::source("r1#a.md").canonical();
        assert_ne!(composite, legacy);
    }
}
