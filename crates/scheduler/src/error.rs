use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("registry error: {0}")]
    Registry(#[from] watchdex_registry::RegistryError),

    #[error("lock error: {0}")]
    Lock(#[from] watchdex_locks::LockError),

    #[error("scanner error: {0}")]
    Scanner(#[from] watchdex_scanner::ScannerError),

    #[error("scheduler stopped")]
    Stopped,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
