use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use super::backoff::{RetryPolicy, retry};
use super::conflict::{ResolvedAction, SkipReason};
use super::differ::ChangeClassification;
use super::local::describe_file;
use super::paths::{PathError, local_path_for, split_parent};
use super::record::{FileRecord, Side};
use super::remote_scan::{parse_modified, revision_token};
use super::state::{BaselineEntry, StateError, StateStore, now_unix};
use crate::remote::{RemoteEntry, RemoteError, RemoteStore};

/// What `DeleteLocal` does with the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LocalDeleteMode {
    /// Move to the desktop trash.
    #[default]
    Trash,
    /// Unlink immediately.
    Remove,
}

/// A resolved action together with the observations it was derived from.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub action: ResolvedAction,
    pub classification: ChangeClassification,
    pub local: Option<FileRecord>,
    pub remote: Option<FileRecord>,
    pub baseline: Option<BaselineEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Uploaded(String),
    Downloaded(String),
    DeletedLocal(String),
    DeletedRemote(String),
    KeptBoth {
        path: String,
        local_copy: String,
        remote_copy: String,
    },
    /// Only the baseline changed (adopted, refreshed or forgotten).
    BaselineUpdated(String),
    Unchanged(String),
    ManualRequired(String),
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("state store: {0}")]
    State(#[from] StateError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("local I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} changed locally while the pass was running")]
    LocalChanged(String),
    #[error("no {side} record for {path}")]
    MissingRecord { side: Side, path: String },
    #[error("moving {path} to trash failed: {message}")]
    Trash { path: String, message: String },
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ExecuteError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ExecuteError::Remote(err) if err.is_auth_failure())
    }
}

/// Applies resolved actions one at a time, committing the baseline for a
/// path as soon as its action has fully succeeded.
pub struct Executor {
    remote: Arc<dyn RemoteStore>,
    state: Arc<StateStore>,
    local_root: PathBuf,
    folders: Mutex<HashMap<String, String>>,
    retry: RetryPolicy,
    local_delete: LocalDeleteMode,
}

impl Executor {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        state: Arc<StateStore>,
        local_root: impl Into<PathBuf>,
        folders: BTreeMap<String, String>,
        retry: RetryPolicy,
        local_delete: LocalDeleteMode,
    ) -> Self {
        Self {
            remote,
            state,
            local_root: local_root.into(),
            folders: Mutex::new(folders.into_iter().collect()),
            retry,
            local_delete,
        }
    }

    pub async fn execute(&self, planned: &PlannedAction) -> Result<ActionOutcome, ExecuteError> {
        match &planned.action {
            ResolvedAction::Upload(path) => self.upload(path, planned).await,
            ResolvedAction::Download(path) => self.download(path, planned).await,
            ResolvedAction::DeleteLocal(path) => self.delete_local(path, planned).await,
            ResolvedAction::DeleteRemote(path) => self.delete_remote(path, planned).await,
            ResolvedAction::RenameAndKeepBoth {
                path,
                new_local_path,
                new_remote_path,
            } => {
                self.keep_both(path, new_local_path, new_remote_path, planned)
                    .await
            }
            ResolvedAction::Skip(path, reason) => self.skip(path, *reason, planned).await,
        }
    }

    async fn upload(
        &self,
        path: &str,
        planned: &PlannedAction,
    ) -> Result<ActionOutcome, ExecuteError> {
        let abs = local_path_for(&self.local_root, path)?;
        let current = self.describe(&abs, path).await?.ok_or_else(|| {
            ExecuteError::LocalChanged(path.to_string())
        })?;

        let entry = match planned.remote.as_ref() {
            Some(remote) if !remote.is_exported() => {
                let remote_id = remote_id_of(remote, path)?;
                retry(&self.retry, "update", || self.remote.update(remote_id, &abs))
                    .await?
            }
            existing => {
                if let Some(native) = existing {
                    let remote_id = remote_id_of(native, path)?;
                    self.remove_remote(remote_id).await?;
                }
                self.create_remote(&abs, path).await?
            }
        };

        self.state
            .commit(
                path,
                &BaselineEntry {
                    fingerprint: current.fingerprint,
                    remote_fingerprint: remote_fingerprint(&entry),
                    remote_id: Some(entry.id),
                    modified_at: current.modified_at,
                    size: current.size,
                },
            )
            .await?;
        tracing::info!(path = %path, "uploaded");
        Ok(ActionOutcome::Uploaded(path.to_string()))
    }

    async fn download(
        &self,
        path: &str,
        planned: &PlannedAction,
    ) -> Result<ActionOutcome, ExecuteError> {
        let remote = planned
            .remote
            .as_ref()
            .ok_or_else(|| missing(Side::Remote, path))?;
        let abs = local_path_for(&self.local_root, path)?;
        self.ensure_local_unchanged(&abs, path, planned.local.as_ref())
            .await?;

        self.fetch(remote, &abs, path).await?;
        self.commit_downloaded(path, &abs, remote, remote_id_of(remote, path)?)
            .await?;
        tracing::info!(path = %path, "downloaded");
        Ok(ActionOutcome::Downloaded(path.to_string()))
    }

    async fn delete_local(
        &self,
        path: &str,
        planned: &PlannedAction,
    ) -> Result<ActionOutcome, ExecuteError> {
        let abs = local_path_for(&self.local_root, path)?;
        self.ensure_local_unchanged(&abs, path, planned.local.as_ref())
            .await?;

        match self.local_delete {
            LocalDeleteMode::Remove => match tokio::fs::remove_file(&abs).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(ExecuteError::Io {
                        path: path.to_string(),
                        source,
                    });
                }
            },
            LocalDeleteMode::Trash => {
                let target = abs.clone();
                let result = tokio::task::spawn_blocking(move || {
                    if target.exists() {
                        trash::delete(&target).map_err(|err| err.to_string())
                    } else {
                        Ok(())
                    }
                })
                .await?;
                result.map_err(|message| ExecuteError::Trash {
                    path: path.to_string(),
                    message,
                })?;
            }
        }

        self.state.remove(path).await?;
        tracing::info!(path = %path, mode = ?self.local_delete, "deleted local file");
        Ok(ActionOutcome::DeletedLocal(path.to_string()))
    }

    async fn delete_remote(
        &self,
        path: &str,
        planned: &PlannedAction,
    ) -> Result<ActionOutcome, ExecuteError> {
        let remote = planned
            .remote
            .as_ref()
            .ok_or_else(|| missing(Side::Remote, path))?;
        self.remove_remote(remote_id_of(remote, path)?).await?;
        self.state.remove(path).await?;
        tracing::info!(path = %path, "deleted remote file");
        Ok(ActionOutcome::DeletedRemote(path.to_string()))
    }

    async fn keep_both(
        &self,
        path: &str,
        new_local_path: &str,
        new_remote_path: &str,
        planned: &PlannedAction,
    ) -> Result<ActionOutcome, ExecuteError> {
        let remote = planned
            .remote
            .as_ref()
            .ok_or_else(|| missing(Side::Remote, path))?;
        let remote_id = remote_id_of(remote, path)?;
        let abs = local_path_for(&self.local_root, path)?;
        self.ensure_local_unchanged(&abs, path, planned.local.as_ref())
            .await?;

        if new_remote_path == path {
            // Remote wins: local content moves aside and is uploaded as a new file.
            let aside = local_path_for(&self.local_root, new_local_path)?;
            rename_local(&abs, &aside, path).await?;
            self.fetch(remote, &abs, path).await?;
            self.commit_downloaded(path, &abs, remote, remote_id).await?;
            self.upload_new(&aside, new_local_path).await?;
        } else {
            // Local wins: remote content moves aside on the remote and is mirrored locally.
            let (_, new_name) = split_parent(new_remote_path);
            let renamed = retry(&self.retry, "rename", || {
                self.remote.rename(remote_id, None, Some(new_name))
            })
            .await?;
            let aside = local_path_for(&self.local_root, new_remote_path)?;
            let mut moved = remote.clone();
            moved.relative_path = new_remote_path.to_string();
            if let Some(modified) = renamed.modified_time.as_deref() {
                moved.modified_at = parse_modified(modified);
                if moved.fingerprint.starts_with("rev:") {
                    moved.fingerprint = revision_token(Some(modified), &renamed.id);
                }
            }
            self.fetch(&moved, &aside, new_remote_path).await?;
            self.commit_downloaded(new_remote_path, &aside, &moved, &renamed.id)
                .await?;
            self.upload_new(&abs, path).await?;
        }

        self.state
            .record_conflict(
                path,
                Some(new_local_path),
                Some(new_remote_path),
                "kept-both",
                now_unix(),
            )
            .await?;
        tracing::warn!(
            path = %path,
            local_copy = %new_local_path,
            remote_copy = %new_remote_path,
            "conflict resolved by keeping both versions"
        );
        Ok(ActionOutcome::KeptBoth {
            path: path.to_string(),
            local_copy: new_local_path.to_string(),
            remote_copy: new_remote_path.to_string(),
        })
    }

    async fn skip(
        &self,
        path: &str,
        reason: SkipReason,
        planned: &PlannedAction,
    ) -> Result<ActionOutcome, ExecuteError> {
        match reason {
            SkipReason::Unchanged | SkipReason::OtherDirection => {
                Ok(ActionOutcome::Unchanged(path.to_string()))
            }
            SkipReason::InSync => {
                let local = planned
                    .local
                    .as_ref()
                    .ok_or_else(|| missing(Side::Local, path))?;
                let remote = planned
                    .remote
                    .as_ref()
                    .ok_or_else(|| missing(Side::Remote, path))?;
                self.state
                    .commit(
                        path,
                        &BaselineEntry {
                            fingerprint: local.fingerprint.clone(),
                            remote_fingerprint: remote.fingerprint.clone(),
                            remote_id: remote.remote_id.clone(),
                            modified_at: local.modified_at,
                            size: local.size,
                        },
                    )
                    .await?;
                tracing::debug!(path = %path, "baseline adopted");
                Ok(ActionOutcome::BaselineUpdated(path.to_string()))
            }
            SkipReason::BothDeleted => {
                self.state.remove(path).await?;
                tracing::debug!(path = %path, "baseline entry dropped");
                Ok(ActionOutcome::BaselineUpdated(path.to_string()))
            }
            SkipReason::RequiresManualResolution => {
                self.state
                    .record_conflict(path, None, None, "manual", now_unix())
                    .await?;
                tracing::warn!(path = %path, "conflict left for manual resolution");
                Ok(ActionOutcome::ManualRequired(path.to_string()))
            }
        }
    }

    /// Uploads `abs` as a brand-new remote file at `path` and commits it.
    async fn upload_new(&self, abs: &Path, path: &str) -> Result<(), ExecuteError> {
        let current = self
            .describe(abs, path)
            .await?
            .ok_or_else(|| ExecuteError::LocalChanged(path.to_string()))?;
        let entry = self.create_remote(abs, path).await?;
        self.state
            .commit(
                path,
                &BaselineEntry {
                    fingerprint: current.fingerprint,
                    remote_fingerprint: remote_fingerprint(&entry),
                    remote_id: Some(entry.id),
                    modified_at: current.modified_at,
                    size: current.size,
                },
            )
            .await?;
        Ok(())
    }

    async fn create_remote(&self, abs: &Path, path: &str) -> Result<RemoteEntry, ExecuteError> {
        let parent_id = self.ensure_parent(path).await?;
        let (_, name) = split_parent(path);
        Ok(retry(&self.retry, "upload", || {
            self.remote.upload(abs, &parent_id, name)
        })
        .await?)
    }

    async fn remove_remote(&self, remote_id: &str) -> Result<(), ExecuteError> {
        match retry(&self.retry, "delete", || self.remote.delete(remote_id)).await {
            Ok(()) | Err(RemoteError::NotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn fetch(&self, remote: &FileRecord, dest: &Path, path: &str) -> Result<(), ExecuteError> {
        let remote_id = remote_id_of(remote, path)?;
        let expected_md5 = (!remote.is_exported() && !remote.fingerprint.starts_with("rev:"))
            .then_some(remote.fingerprint.as_str());
        retry(&self.retry, "download", || {
            self.remote.download(
                remote_id,
                remote.export_mime.as_deref(),
                expected_md5,
                dest,
            )
        })
        .await?;
        Ok(())
    }

    async fn commit_downloaded(
        &self,
        path: &str,
        abs: &Path,
        remote: &FileRecord,
        remote_id: &str,
    ) -> Result<(), ExecuteError> {
        let written = self
            .describe(abs, path)
            .await?
            .ok_or_else(|| ExecuteError::LocalChanged(path.to_string()))?;
        self.state
            .commit(
                path,
                &BaselineEntry {
                    fingerprint: written.fingerprint,
                    remote_fingerprint: remote.fingerprint.clone(),
                    remote_id: Some(remote_id.to_string()),
                    modified_at: remote.modified_at,
                    size: written.size,
                },
            )
            .await?;
        Ok(())
    }

    /// Folder id for the parent of `path`, creating missing remote folders.
    /// Creation is serialized so concurrent workers never duplicate a folder.
    async fn ensure_parent(&self, path: &str) -> Result<String, ExecuteError> {
        let (parent, _) = split_parent(path);
        let mut folders = self.folders.lock().await;
        if let Some(id) = folders.get(parent) {
            return Ok(id.clone());
        }

        let mut current_rel = String::new();
        let mut current_id = folders
            .get("")
            .cloned()
            .ok_or_else(|| missing(Side::Remote, "/"))?;
        for name in parent.split('/') {
            current_rel = if current_rel.is_empty() {
                name.to_string()
            } else {
                format!("{current_rel}/{name}")
            };
            current_id = match folders.get(&current_rel) {
                Some(id) => id.clone(),
                None => {
                    let parent_id = current_id.clone();
                    let id = retry(&self.retry, "create-folder", || {
                        self.remote.ensure_folder(&parent_id, name)
                    })
                    .await?;
                    folders.insert(current_rel.clone(), id.clone());
                    id
                }
            };
        }
        Ok(current_id)
    }

    /// Fails unless the local file still matches what the scan observed.
    async fn ensure_local_unchanged(
        &self,
        abs: &Path,
        path: &str,
        observed: Option<&FileRecord>,
    ) -> Result<(), ExecuteError> {
        let current = self.describe(abs, path).await?;
        let unchanged = match (observed, current) {
            (None, None) => true,
            (Some(seen), Some(now)) => seen.fingerprint == now.fingerprint,
            _ => false,
        };
        if unchanged {
            Ok(())
        } else {
            Err(ExecuteError::LocalChanged(path.to_string()))
        }
    }

    async fn describe(&self, abs: &Path, path: &str) -> Result<Option<FileRecord>, ExecuteError> {
        let target = abs.to_path_buf();
        let rel = path.to_string();
        let result = tokio::task::spawn_blocking(move || {
            if !target.is_file() {
                return Ok(None);
            }
            describe_file(&target, rel).map(Some)
        })
        .await?;
        result.map_err(|source| ExecuteError::Io {
            path: path.to_string(),
            source,
        })
    }
}

async fn rename_local(from: &Path, to: &Path, path: &str) -> Result<(), ExecuteError> {
    let io_err = |source: io::Error| ExecuteError::Io {
        path: path.to_string(),
        source,
    };
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::rename(from, to).await.map_err(io_err)
}

fn remote_id_of<'a>(record: &'a FileRecord, path: &str) -> Result<&'a str, ExecuteError> {
    record
        .remote_id
        .as_deref()
        .ok_or_else(|| missing(Side::Remote, path))
}

fn missing(side: Side, path: &str) -> ExecuteError {
    ExecuteError::MissingRecord {
        side,
        path: path.to_string(),
    }
}

fn remote_fingerprint(entry: &RemoteEntry) -> String {
    match &entry.md5 {
        Some(md5) => md5.to_ascii_lowercase(),
        None => revision_token(entry.modified_time.as_deref(), &entry.id),
    }
}
