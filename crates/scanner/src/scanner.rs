use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

const IGNORED_TOP_LEVEL: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".watchdex",
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
];

/// Gitignore-aware directory walker producing the candidate file set for a
/// scan.
pub struct FileScanner {
    root: PathBuf,
}

impl FileScanner {
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Walks the root and returns every regular file worth indexing, sorted
    /// for deterministic diffs. Walk errors on individual entries are logged
    /// and skipped; they do not abort the walk.
    #[must_use]
    pub fn scan(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(true)
            .require_git(false)
            .git_global(false)
            .follow_links(false)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Walk error under {}: {err}", self.root.display());
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            if self.is_ignored(entry.path()) {
                continue;
            }
            files.push(entry.into_path());
        }

        files.sort();
        files
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return true;
        };
        if let Some(first) = relative.components().next() {
            let first = first.as_os_str().to_string_lossy().to_lowercase();
            if IGNORED_TOP_LEVEL.iter().any(|ignored| first == *ignored) {
                return true;
            }
        }
        relative
            .file_name()
            .map(|name| name.to_string_lossy() == ".gitignore")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"content").unwrap();
    }

    #[test]
    fn scan_skips_ignored_directories_and_sorts() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "b.md");
        touch(dir.path(), "a/doc.txt");
        touch(dir.path(), ".git/config");
        touch(dir.path(), "node_modules/pkg/index.js");
        touch(dir.path(), ".watchdex/roots.json");

        let scanner = FileScanner::new(dir.path());
        let files: Vec<String> = scanner
            .scan()
            .iter()
            .map(|p| {
                p.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .to_string()
            })
            .collect();
        assert_eq!(files, vec!["a/doc.txt".to_string(), "b.md".to_string()]);
    }

    #[test]
    fn scan_respects_gitignore() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "keep.md");
        touch(dir.path(), "scratch/tmp.log");
        std::fs::write(dir.path().join(".gitignore"), "scratch/\n").unwrap();

        let scanner = FileScanner::new(dir.path());
        let files = scanner.scan();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("keep.md"));
    }
}
