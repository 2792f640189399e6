//! # Watchdex Scheduler
//!
//! Periodic selection and dispatch of eligible watched roots.
//!
//! ## Loop shape
//!
//! ```text
//! tick ──> registry.list (scope-filtered, re-read every tick)
//!            │
//!            ├──> skip paused / running / not-yet-due roots
//!            │
//!            ├──> Scope Guard re-validation (defense in depth)
//!            │
//!            ├──> Lock Manager claim (LockHeld ⇒ skip this tick)
//!            │
//!            └──> spawn scan task ──> outcome ──> Status Store + registry
//! ```
//!
//! Two variants share the loop: the client variant acts only on roots owned
//! by its own executor identity; the server variant acts on server-scope
//! roots and only while it holds the singleton lease; a lease held elsewhere
//! is an idle tick, not an error.

mod error;
mod run;
mod scheduler;
mod status;

pub use error::{Result, SchedulerError};
pub use run::{IndexingRun, RunId};
pub use scheduler::{
    is_due, next_due_ms, Scheduler, SchedulerCommand, SchedulerConfig, SchedulerHandle,
};
pub use status::{load_health_snapshot, RootHealth, RootState, RunSummary, StatusStore};
