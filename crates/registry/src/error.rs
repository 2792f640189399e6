use crate::model::{ExecutionScope, RootId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("duplicate root: {path} is already registered under {scope} scope")]
    DuplicateRoot { path: String, scope: ExecutionScope },

    #[error("invalid path for {scope} scope: {reason}")]
    InvalidPathForScope {
        scope: ExecutionScope,
        reason: String,
    },

    #[error("scope conflict on {root_id}: owned by {owner}, requested as {requester}")]
    ScopeConflict {
        root_id: RootId,
        owner: String,
        requester: String,
    },

    #[error("scope transition conflict on {root_id}: {path} already owned under target scope")]
    ScopeTransitionConflict { root_id: RootId, path: String },

    #[error("root not found: {0}")]
    RootNotFound(RootId),

    #[error("invalid root: {0}")]
    InvalidRoot(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
