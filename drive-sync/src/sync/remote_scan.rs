use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures_util::TryStreamExt;
use gdrive_core::export_format_for;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::backoff::RetryPolicy;
use super::paths::{IgnoreRules, is_within, join_relative};
use super::record::{FileRecord, Side, SkippedPath};
use crate::remote::{RemoteEntry, RemoteError, RemoteStore, list_children};

#[derive(Debug, Error)]
#[error("listing remote folder '{folder}' failed: {source}")]
pub struct RemoteScanError {
    pub folder: String,
    #[source]
    pub source: RemoteError,
}

impl RemoteScanError {
    pub fn is_auth_failure(&self) -> bool {
        self.source.is_auth_failure()
    }
}

/// Current remote tree below the sync root.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub root_id: String,
    pub files: BTreeMap<String, FileRecord>,
    /// Relative folder path to folder id; the root is "".
    pub folders: BTreeMap<String, String>,
    pub skipped: Vec<SkippedPath>,
}

impl RemoteSnapshot {
    pub fn is_skipped(&self, path: &str) -> bool {
        self.skipped.iter().any(|s| is_within(path, &s.path))
    }
}

pub struct RemoteScanner {
    remote: Arc<dyn RemoteStore>,
    ignore: IgnoreRules,
    retry: RetryPolicy,
}

impl RemoteScanner {
    pub fn new(remote: Arc<dyn RemoteStore>, ignore: IgnoreRules, retry: RetryPolicy) -> Self {
        Self {
            remote,
            ignore,
            retry,
        }
    }

    /// Breadth-first listing of every folder under `root_id`. Any listing
    /// failure (after retries) fails the whole scan.
    pub async fn scan(&self, root_id: &str) -> Result<RemoteSnapshot, RemoteScanError> {
        let mut snapshot = RemoteSnapshot {
            root_id: root_id.to_string(),
            ..RemoteSnapshot::default()
        };
        snapshot.folders.insert(String::new(), root_id.to_string());

        let mut queue = VecDeque::from([(root_id.to_string(), String::new())]);
        while let Some((folder_id, folder_rel)) = queue.pop_front() {
            let children: Vec<RemoteEntry> =
                list_children(self.remote.as_ref(), &folder_id, &self.retry)
                    .try_collect()
                    .await
                    .map_err(|source| RemoteScanError {
                        folder: if folder_rel.is_empty() {
                            "/".to_string()
                        } else {
                            folder_rel.clone()
                        },
                        source,
                    })?;

            let mut by_path: BTreeMap<String, Vec<RemoteEntry>> = BTreeMap::new();
            for entry in children {
                if entry.name.contains('/') || entry.name.is_empty() {
                    snapshot.skipped.push(SkippedPath {
                        side: Side::Remote,
                        path: join_relative(&folder_rel, &entry.name),
                        reason: "name cannot be mapped to a local path".into(),
                    });
                    continue;
                }
                let name = local_name(&entry);
                by_path
                    .entry(join_relative(&folder_rel, &name))
                    .or_default()
                    .push(entry);
            }

            for (rel, mut entries) in by_path {
                let first_is_dir = entries.first().is_some_and(|e| e.is_folder);
                if self.ignore.is_ignored(&rel, first_is_dir) {
                    continue;
                }
                if entries.len() > 1 {
                    tracing::warn!(path = %rel, count = entries.len(), "duplicate remote names; skipping");
                    snapshot.skipped.push(SkippedPath {
                        side: Side::Remote,
                        path: rel,
                        reason: format!("{} remote items share this name", entries.len()),
                    });
                    continue;
                }
                let Some(entry) = entries.pop() else {
                    continue;
                };

                if entry.is_folder {
                    snapshot.folders.insert(rel.clone(), entry.id.clone());
                    queue.push_back((entry.id, rel));
                    continue;
                }
                match record_for(&rel, entry) {
                    Some(record) => {
                        snapshot.files.insert(rel, record);
                    }
                    None => snapshot.skipped.push(SkippedPath {
                        side: Side::Remote,
                        path: rel,
                        reason: "document type has no export format".into(),
                    }),
                }
            }
        }

        tracing::debug!(
            files = snapshot.files.len(),
            folders = snapshot.folders.len(),
            skipped = snapshot.skipped.len(),
            "remote scan finished"
        );
        Ok(snapshot)
    }
}

/// Name used on the local side; exported documents gain their Office extension.
fn local_name(entry: &RemoteEntry) -> String {
    if entry.is_folder {
        return entry.name.clone();
    }
    match export_format_for(&entry.mime_type) {
        Some((_, ext)) if !entry.name.to_lowercase().ends_with(&format!(".{ext}")) => {
            format!("{}.{ext}", entry.name)
        }
        _ => entry.name.clone(),
    }
}

fn record_for(rel: &str, entry: RemoteEntry) -> Option<FileRecord> {
    let export_mime = if is_native(&entry.mime_type) {
        Some(export_format_for(&entry.mime_type)?.0.to_string())
    } else {
        None
    };
    let fingerprint = match (&export_mime, &entry.md5) {
        (None, Some(md5)) => md5.to_ascii_lowercase(),
        _ => revision_token(entry.modified_time.as_deref(), &entry.id),
    };
    Some(FileRecord {
        relative_path: rel.to_string(),
        fingerprint,
        size: entry.size.unwrap_or(0),
        modified_at: entry
            .modified_time
            .as_deref()
            .map(parse_modified)
            .unwrap_or(0),
        remote_id: Some(entry.id),
        is_directory: false,
        parent_id: entry.parent_id,
        export_mime,
    })
}

fn is_native(mime_type: &str) -> bool {
    mime_type.starts_with("application/vnd.google-apps.")
}

/// Change token for content without an md5.
pub fn revision_token(modified_time: Option<&str>, id: &str) -> String {
    format!("rev:{}", modified_time.unwrap_or(id))
}

pub fn parse_modified(value: &str) -> i64 {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|at| at.unix_timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::MemoryRemote;

    fn scanner(remote: Arc<MemoryRemote>) -> RemoteScanner {
        RemoteScanner::new(
            remote,
            IgnoreRules::with_defaults::<&str>(&[]).unwrap(),
            RetryPolicy::immediate(3),
        )
    }

    #[tokio::test]
    async fn walks_nested_folders_across_pages() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_file("a.txt", b"a", 10);
        remote.put_file("b.txt", b"b", 10);
        remote.put_file("c.txt", b"c", 10);
        remote.put_file("Docs/Sub/d.txt", b"d", 10);

        let snapshot = scanner(remote.clone()).scan(MemoryRemote::ROOT).await.unwrap();

        let paths: Vec<_> = snapshot.files.keys().cloned().collect();
        assert_eq!(paths, vec!["Docs/Sub/d.txt", "a.txt", "b.txt", "c.txt"]);
        assert!(snapshot.folders.contains_key("Docs/Sub"));
        let a = &snapshot.files["a.txt"];
        assert_eq!(a.fingerprint, format!("{:x}", md5::compute(b"a")));
        assert_eq!(a.modified_at, 10);
        assert!(a.remote_id.is_some());
    }

    #[tokio::test]
    async fn documents_are_exported_and_unsupported_types_skipped() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_native(
            "Report",
            "application/vnd.google-apps.document",
            "2024-03-01T10:00:00.000Z",
        );
        remote.put_native(
            "Survey",
            "application/vnd.google-apps.form",
            "2024-03-01T10:00:00.000Z",
        );

        let snapshot = scanner(remote).scan(MemoryRemote::ROOT).await.unwrap();

        let doc = &snapshot.files["Report.docx"];
        assert_eq!(doc.fingerprint, "rev:2024-03-01T10:00:00.000Z");
        assert!(doc.is_exported());
        assert!(!snapshot.files.contains_key("Survey"));
        assert!(snapshot.is_skipped("Survey"));
    }

    #[tokio::test]
    async fn duplicate_names_are_skipped() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_file("dup.txt", b"one", 1);
        remote.put_duplicate("dup.txt", b"two", 2);

        let snapshot = scanner(remote).scan(MemoryRemote::ROOT).await.unwrap();
        assert!(snapshot.files.is_empty());
        assert!(snapshot.is_skipped("dup.txt"));
    }

    #[tokio::test]
    async fn ignored_remote_paths_are_excluded() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_file(".hidden/x.txt", b"x", 1);
        remote.put_file("notes.tmp", b"t", 1);
        remote.put_file("keep.txt", b"k", 1);

        let snapshot = scanner(remote).scan(MemoryRemote::ROOT).await.unwrap();
        let paths: Vec<_> = snapshot.files.keys().cloned().collect();
        assert_eq!(paths, vec!["keep.txt"]);
    }

    #[tokio::test]
    async fn listing_failure_aborts_scan() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_file("a.txt", b"a", 1);
        remote.fail_listing(RemoteError::Unauthorized("revoked".into()));

        let err = scanner(remote).scan(MemoryRemote::ROOT).await.unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn transient_listing_errors_are_retried() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_file("a.txt", b"a", 1);
        remote.fail_next_listings(2);

        let snapshot = scanner(remote).scan(MemoryRemote::ROOT).await.unwrap();
        assert!(snapshot.files.contains_key("a.txt"));
    }

    #[test]
    fn parses_drive_timestamps() {
        assert_eq!(parse_modified("1970-01-01T00:01:40.000Z"), 100);
        assert_eq!(parse_modified("garbage"), 0);
    }
}
