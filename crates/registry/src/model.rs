use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable opaque identity of a watched root. Immutable once created; the
/// anchor for locks, run records, and status history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RootId(String);

impl RootId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RootId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which scheduler variant may act on a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionScope {
    Client,
    Server,
}

impl fmt::Display for ExecutionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// Identity of a caller asking the registry or a scheduler to act.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub scope: ExecutionScope,
    pub executor_id: Option<String>,
}

impl Requester {
    #[must_use]
    pub fn client(executor_id: impl Into<String>) -> Self {
        Self {
            scope: ExecutionScope::Client,
            executor_id: Some(executor_id.into()),
        }
    }

    #[must_use]
    pub const fn server() -> Self {
        Self {
            scope: ExecutionScope::Server,
            executor_id: None,
        }
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.executor_id {
            Some(id) => write!(f, "{} {id}", self.scope),
            None => write!(f, "{}", self.scope),
        }
    }
}

/// A folder registered for periodic scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedRoot {
    pub root_id: RootId,
    pub normalized_path: String,
    pub execution_scope: ExecutionScope,
    /// Required when scope is `client`, must be absent when scope is `server`.
    pub executor_id: Option<String>,
    /// Scan interval in seconds.
    pub schedule_secs: u64,
    pub enabled: bool,
    pub paused: bool,
    pub max_concurrency: u32,
    pub last_scan_started_at: Option<u64>,
    pub last_scan_completed_at: Option<u64>,
    pub last_successful_scan_at: Option<u64>,
    pub last_error_at: Option<u64>,
    pub consecutive_failures: u32,
}

impl WatchedRoot {
    /// Checks the ownership invariant: `scope=client ⟺ executor_id set`.
    pub fn validate(&self) -> Result<()> {
        match (self.execution_scope, &self.executor_id) {
            (ExecutionScope::Client, None) => Err(RegistryError::InvalidRoot(format!(
                "client root {} has no executor_id",
                self.root_id
            ))),
            (ExecutionScope::Server, Some(id)) => Err(RegistryError::InvalidRoot(format!(
                "server root {} carries executor_id {id}",
                self.root_id
            ))),
            _ => Ok(()),
        }
    }

    /// Human-readable owner, for conflict messages ("owned by X, not you").
    #[must_use]
    pub fn owner(&self) -> String {
        match &self.executor_id {
            Some(id) => format!("{} {id}", self.execution_scope),
            None => self.execution_scope.to_string(),
        }
    }
}

/// Registration request. Scope fields are optional; omitting them binds the
/// root to the caller's own scope and identity.
#[derive(Debug, Clone, Default)]
pub struct NewRoot {
    pub path: String,
    pub scope: Option<ExecutionScope>,
    pub executor_id: Option<String>,
    pub schedule_secs: Option<u64>,
    pub max_concurrency: Option<u32>,
}

impl NewRoot {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Filter for [`crate::RootRegistry::list`]. Schedulers always set `scope`
/// (and `executor_id` for the client variant); the unfiltered form exists for
/// admin tooling only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootFilter {
    pub scope: Option<ExecutionScope>,
    pub executor_id: Option<String>,
    pub enabled: Option<bool>,
}

impl RootFilter {
    #[must_use]
    pub fn for_requester(requester: &Requester) -> Self {
        Self {
            scope: Some(requester.scope),
            executor_id: requester.executor_id.clone(),
            enabled: Some(true),
        }
    }

    #[must_use]
    pub fn matches(&self, root: &WatchedRoot) -> bool {
        if let Some(scope) = self.scope {
            if root.execution_scope != scope {
                return false;
            }
        }
        if let Some(executor_id) = &self.executor_id {
            if root.executor_id.as_deref() != Some(executor_id.as_str()) {
                return false;
            }
        }
        if let Some(enabled) = self.enabled {
            if root.enabled != enabled {
                return false;
            }
        }
        true
    }
}

/// Lexical path normalization used for uniqueness and lock keying. Client
/// paths are not resolvable on the server filesystem, so no canonicalization
/// happens here; separators are unified and trailing separators dropped.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}
