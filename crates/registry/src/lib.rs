//! # Watchdex Registry
//!
//! Durable store of watched roots and their ownership metadata.
//!
//! ## Responsibilities
//!
//! ```text
//! Registration
//!     │
//!     ├──> Scoped uniqueness check (per owner for client roots,
//!     │    per path for server roots)
//!     │
//!     ├──> Scope Guard (authorize every mutating caller)
//!     │
//!     └──> Scope transitions (preflight check + atomic in-place update)
//! ```
//!
//! Both scheduler variants consult the registry through [`RootRegistry::list`]
//! with a scope filter; nothing caches registry state across scheduling ticks.

mod error;
mod model;
mod registry;
mod store;

pub use error::{RegistryError, Result};
pub use model::{
    normalize_path, ExecutionScope, NewRoot, Requester, RootFilter, RootId, WatchedRoot,
};
pub use registry::RootRegistry;
pub use store::unix_now_ms;
