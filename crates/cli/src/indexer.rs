//! File-backed indexer used by the standalone binary.
//!
//! Deployments normally point the scheduler at a real indexing engine; the
//! binary ships with a local document store so a fresh checkout still
//! produces visible output: one JSON record per indexed file under
//! `<state>/index/<root-key>/`.

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use watchdex_registry::unix_now_ms;
use watchdex_scanner::{Indexer, IndexerFailure};

#[derive(Debug, Serialize)]
struct DocRecord<'a> {
    rel_path: &'a str,
    size_bytes: u64,
    indexed_at_ms: u64,
}

pub struct LocalIndexer {
    index_dir: PathBuf,
}

impl LocalIndexer {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            index_dir: state_dir.as_ref().join("index"),
        }
    }

    /// Records are keyed by hash: root paths and relative paths both contain
    /// separators that do not survive as file names.
    fn doc_path(&self, root: &Path, rel_path: &str) -> PathBuf {
        self.index_dir
            .join(short_hash(root.to_string_lossy().as_bytes()))
            .join(format!("{}.json", short_hash(rel_path.as_bytes())))
    }
}

fn short_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    format!("{digest:x}")[..16].to_string()
}

#[async_trait]
impl Indexer for LocalIndexer {
    async fn upsert(&self, root: &Path, rel_path: &str) -> Result<(), IndexerFailure> {
        let source = root.join(rel_path);
        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|err| IndexerFailure::parse(format!("{}: {err}", source.display())))?;

        let record = DocRecord {
            rel_path,
            size_bytes: meta.len(),
            indexed_at_ms: unix_now_ms(),
        };
        let path = self.doc_path(root, rel_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| IndexerFailure::write(err.to_string()))?;
        }
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|err| IndexerFailure::write(err.to_string()))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| IndexerFailure::write(err.to_string()))?;
        Ok(())
    }

    async fn remove(&self, root: &Path, rel_path: &str) -> Result<(), IndexerFailure> {
        let path = self.doc_path(root, rel_path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(IndexerFailure::write(err.to_string())),
        }
    }
}
