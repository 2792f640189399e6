use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SCANS_DIR_NAME: &str = "scans";

/// Previously indexed state of one root: relative path → content hash.
///
/// This is the diff baseline; content-hash comparison makes re-dispatch of an
/// abandoned scan's writes idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanState {
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

#[must_use]
pub fn scan_state_path(state_dir: &Path, root_id: &str) -> PathBuf {
    state_dir.join(SCANS_DIR_NAME).join(format!("{root_id}.json"))
}

impl ScanState {
    pub async fn load(state_dir: &Path, root_id: &str) -> Result<Self> {
        let path = scan_state_path(state_dir, root_id);
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomic tmp + rename write, so a crashed scan never leaves a truncated
    /// baseline behind.
    pub async fn save(&self, state_dir: &Path, root_id: &str) -> Result<()> {
        let path = scan_state_path(state_dir, root_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
