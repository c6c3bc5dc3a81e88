use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;
use walkdir::WalkDir;

use super::paths::{IgnoreRules, is_within, relative_path};
use super::record::{FileRecord, Side, SkippedPath};

const HASH_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("local root {path} is not readable: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("local root {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Current local tree, keyed by normalized relative path.
#[derive(Debug, Clone, Default)]
pub struct LocalSnapshot {
    pub files: BTreeMap<String, FileRecord>,
    pub skipped: Vec<SkippedPath>,
}

impl LocalSnapshot {
    /// True when `path` or one of its ancestors could not be read.
    pub fn is_skipped(&self, path: &str) -> bool {
        self.skipped.iter().any(|s| is_within(path, &s.path))
    }
}

#[derive(Debug, Clone)]
pub struct LocalScanner {
    root: PathBuf,
    ignore: IgnoreRules,
}

impl LocalScanner {
    pub fn new(root: impl Into<PathBuf>, ignore: IgnoreRules) -> Self {
        Self {
            root: root.into(),
            ignore,
        }
    }

    pub async fn scan(&self) -> Result<LocalSnapshot, ScanError> {
        let scanner = self.clone();
        tokio::task::spawn_blocking(move || scanner.scan_blocking()).await?
    }

    pub fn scan_blocking(&self) -> Result<LocalSnapshot, ScanError> {
        let meta = std::fs::metadata(&self.root).map_err(|source| ScanError::RootUnreadable {
            path: self.root.clone(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ScanError::NotADirectory(self.root.clone()));
        }
        std::fs::read_dir(&self.root).map_err(|source| ScanError::RootUnreadable {
            path: self.root.clone(),
            source,
        })?;

        let mut snapshot = LocalSnapshot::default();
        let root = self.root.clone();
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                match relative_path(&root, entry.path()) {
                    Ok(rel) => !self.ignore.is_ignored(&rel, entry.file_type().is_dir()),
                    Err(_) => true,
                }
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .and_then(|p| relative_path(&self.root, p).ok())
                        .unwrap_or_default();
                    if path.is_empty() {
                        tracing::warn!(error = %err, "skipping unreadable local entry");
                        continue;
                    }
                    tracing::warn!(path = %path, error = %err, "skipping unreadable local path");
                    snapshot.skipped.push(SkippedPath {
                        side: Side::Local,
                        path,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = match relative_path(&self.root, entry.path()) {
                Ok(rel) => rel,
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), error = %err, "skipping local path");
                    snapshot.skipped.push(SkippedPath {
                        side: Side::Local,
                        path: entry.path().to_string_lossy().into_owned(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            match describe_file(entry.path(), rel.clone()) {
                Ok(record) => {
                    snapshot.files.insert(rel, record);
                }
                Err(err) => {
                    tracing::warn!(path = %rel, error = %err, "skipping unreadable local file");
                    snapshot.skipped.push(SkippedPath {
                        side: Side::Local,
                        path: rel,
                        reason: err.to_string(),
                    });
                }
            }
        }

        tracing::debug!(
            files = snapshot.files.len(),
            skipped = snapshot.skipped.len(),
            "local scan finished"
        );
        Ok(snapshot)
    }
}

/// Builds a record for one regular file, hashing its full content.
pub fn describe_file(path: &Path, relative: String) -> io::Result<FileRecord> {
    let meta = std::fs::metadata(path)?;
    let fingerprint = fingerprint_file(path)?;
    Ok(FileRecord::local(
        relative,
        fingerprint,
        meta.len(),
        mtime_secs(&meta),
    ))
}

/// MD5 of the file content as lowercase hex.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn scans_nested_files_in_order() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Docs/Sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("Docs/a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("Docs/Sub/c.txt"), b"c").unwrap();

        let scanner = LocalScanner::new(dir.path(), IgnoreRules::none());
        let snapshot = scanner.scan().await.unwrap();

        let paths: Vec<_> = snapshot.files.keys().cloned().collect();
        assert_eq!(paths, vec!["Docs/Sub/c.txt", "Docs/a.txt", "b.txt"]);
        let a = &snapshot.files["Docs/a.txt"];
        assert_eq!(a.fingerprint, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(a.size, 5);
        assert!(!a.is_directory);
        assert!(snapshot.skipped.is_empty());
    }

    #[tokio::test]
    async fn ignore_rules_exclude_files_and_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), b"ref").unwrap();
        std::fs::write(dir.path().join("build/out.bin"), b"x").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        std::fs::write(dir.path().join("draft.tmp"), b"t").unwrap();
        std::fs::write(dir.path().join("keep.txt.partial"), b"p").unwrap();

        let rules = IgnoreRules::with_defaults(&["build/"]).unwrap();
        let snapshot = LocalScanner::new(dir.path(), rules).scan().await.unwrap();

        let paths: Vec<_> = snapshot.files.keys().cloned().collect();
        assert_eq!(paths, vec!["keep.txt"]);
    }

    #[tokio::test]
    async fn missing_root_is_fatal() {
        let dir = tempdir().unwrap();
        let scanner = LocalScanner::new(dir.path().join("absent"), IgnoreRules::none());
        assert!(matches!(
            scanner.scan().await,
            Err(ScanError::RootUnreadable { .. })
        ));
    }

    #[test]
    fn skipped_prefix_covers_descendants() {
        let snapshot = LocalSnapshot {
            files: BTreeMap::new(),
            skipped: vec![SkippedPath {
                side: Side::Local,
                path: "Private".into(),
                reason: "permission denied".into(),
            }],
        };
        assert!(snapshot.is_skipped("Private/a.txt"));
        assert!(snapshot.is_skipped("Private"));
        assert!(!snapshot.is_skipped("Public/a.txt"));
    }

    #[test]
    fn fingerprint_is_content_md5() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            fingerprint_file(&path).unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }
}
