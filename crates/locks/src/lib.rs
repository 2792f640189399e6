//! # Watchdex Locks
//!
//! Short-lived exclusive claims over indexing targets, plus the singleton
//! lease that keeps at most one server scheduler loop active.
//!
//! Locks are TTL-bound and lazily expired: an unexpired incumbent blocks a
//! new acquirer with [`LockError::LockHeld`], while an expired one is treated
//! as absent the moment the next acquirer checks. No background sweep and no
//! liveness channel; a crashed holder simply lets its lock age out.
//!
//! The lock table is a JSON file in the shared state dir, so separate
//! processes over the same state contend on one lock space.

mod error;
mod lease;
mod lock;

pub use error::{LockError, Result};
pub use lease::{LeaseCoordinator, LeaseGuard, SERVER_SCHEDULER_LEASE};
pub use lock::{DocumentLock, LockConfig, LockKey, LockManager, LockToken, DEFAULT_LOCK_TTL};
