use crate::error::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Fixed, deterministic lease identifier: every server process contends on
/// the same point, so at most one server scheduler loop is ever active.
pub const SERVER_SCHEDULER_LEASE: &str = "watchdex-server-scheduler";

/// Non-blocking singleton lease over an exclusive advisory file lock.
///
/// The lease is a transient coordination primitive, not application data: it
/// lives only as long as the holding process (the OS drops the advisory lock
/// on exit, crash included) and is re-acquired on restart.
pub struct LeaseCoordinator {
    state_dir: PathBuf,
}

impl LeaseCoordinator {
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
        }
    }

    /// Returns a guard when this process now holds the lease, `None` when
    /// another live process does. Never blocks.
    pub fn try_acquire(&self, lease_id: &str) -> Result<Option<LeaseGuard>> {
        std::fs::create_dir_all(&self.state_dir)?;
        let path = self.state_dir.join(format!("{lease_id}.lease"));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = writeln!(file, "pid={}", std::process::id());
                log::info!("Acquired lease {lease_id}");
                Ok(Some(LeaseGuard { file, lease_id: lease_id.to_string() }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Holds the lease for the guard's lifetime; dropping it releases cleanly.
pub struct LeaseGuard {
    file: File,
    lease_id: String,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            log::warn!("Failed to release lease {}: {err}", self.lease_id);
        } else {
            log::info!("Released lease {}", self.lease_id);
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lease_id", &self.lease_id)
            .finish_non_exhaustive()
    }
}
