use crate::error::Result;
use crate::model::WatchedRoot;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const ROOTS_FILE_NAME: &str = "roots.json";
const ROOTS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRoots {
    schema_version: u32,
    roots: Vec<WatchedRoot>,
}

pub(crate) fn roots_path(state_dir: &Path) -> PathBuf {
    state_dir.join(ROOTS_FILE_NAME)
}

pub(crate) async fn load_roots(state_dir: &Path) -> Result<Vec<WatchedRoot>> {
    let path = roots_path(state_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = tokio::fs::read(&path).await?;
    let persisted: PersistedRoots = serde_json::from_slice(&bytes)?;
    Ok(persisted.roots)
}

/// Writes the full root set atomically: serialize to a sibling tmp file, then
/// rename over the live file so readers never observe a partial write.
pub(crate) async fn save_roots(state_dir: &Path, roots: Vec<WatchedRoot>) -> Result<()> {
    tokio::fs::create_dir_all(state_dir).await?;
    let path = roots_path(state_dir);
    let persisted = PersistedRoots {
        schema_version: ROOTS_SCHEMA_VERSION,
        roots,
    };
    let bytes = serde_json::to_vec_pretty(&persisted)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

#[must_use]
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
