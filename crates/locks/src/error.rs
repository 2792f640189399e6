use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock held by {holder_id}, expires in {}s", expires_in.as_secs())]
    LockHeld {
        holder_id: String,
        expires_in: Duration,
    },

    #[error("legacy source lock keys are disabled")]
    LegacyKeysDisabled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
