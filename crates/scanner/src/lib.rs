//! # Watchdex Scanner
//!
//! Runs a single folder scan without blocking the scheduling path.
//!
//! ## Pipeline
//!
//! ```text
//! Watched root
//!     │
//!     ├──> File Scanner (.gitignore aware walk + SHA-256, off-thread)
//!     │      └─> current content map
//!     │
//!     ├──> Diff against the persisted scan state
//!     │      └─> adds / updates / deletes
//!     │
//!     └──> Indexer collaborator (adds/updates/deletes dispatched)
//!            └─> per-run outcome + refreshed scan state
//! ```
//!
//! Individual file failures are skipped and accumulated into the outcome; a
//! destination write failure is the one unrecoverable class and aborts the
//! run. `dry_run` reports the planned operations without mutating anything.

mod error;
mod executor;
mod outcome;
mod scan_state;
mod scanner;

pub use error::{Result, ScannerError};
pub use executor::{ExecutorConfig, Indexer, IndexerFailure, ScanExecutor};
pub use outcome::{FileError, FileErrorKind, PlannedChange, PlannedOp, RunStatus, ScanOutcome};
pub use scan_state::{scan_state_path, ScanState};
pub use scanner::FileScanner;
