mod drive;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, TryStreamExt, stream};
use gdrive_core::{ApiErrorClass, DriveError};
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::sync::backoff::{RetryPolicy, retry};
use crate::sync::transfer::TransferError;

pub use drive::DriveRemote;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("rate limited by the remote")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote rejected credentials: {0}")]
    Unauthorized(String),
    #[error("remote object not found")]
    NotFound,
    #[error("remote request failed: {0}")]
    Permanent(String),
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authentication failed: {0}")]
    Authentication(#[source] CredentialError),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::RateLimited { .. } | RemoteError::Transient(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Errors after which no further remote call can succeed in this pass.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            RemoteError::Unauthorized(_) | RemoteError::Authentication(_)
        )
    }
}

impl From<DriveError> for RemoteError {
    fn from(err: DriveError) -> Self {
        match err.classification() {
            Some(ApiErrorClass::RateLimit) => RemoteError::RateLimited {
                retry_after: err.retry_after(),
            },
            Some(ApiErrorClass::Auth) => RemoteError::Unauthorized(err.to_string()),
            Some(ApiErrorClass::NotFound) => RemoteError::NotFound,
            Some(ApiErrorClass::Transient) => RemoteError::Transient(err.to_string()),
            Some(ApiErrorClass::Permanent) => RemoteError::Permanent(err.to_string()),
            None if err.is_retryable() => RemoteError::Transient(err.to_string()),
            None => RemoteError::Permanent(err.to_string()),
        }
    }
}

impl From<CredentialError> for RemoteError {
    fn from(err: CredentialError) -> Self {
        match err {
            err if err.is_transient() => RemoteError::Transient(err.to_string()),
            CredentialError::Io(io) => RemoteError::Io(io),
            err => RemoteError::Authentication(err),
        }
    }
}

impl From<TransferError> for RemoteError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Api(api) => api.into(),
            TransferError::Io(io) => RemoteError::Io(io),
            other if other.is_retryable() => RemoteError::Transient(other.to_string()),
            other => RemoteError::Permanent(other.to_string()),
        }
    }
}

/// Remote file or folder as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub is_folder: bool,
    pub mime_type: String,
    pub md5: Option<String>,
    pub size: Option<u64>,
    /// RFC 3339 as reported by the remote.
    pub modified_time: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub entries: Vec<RemoteEntry>,
    pub next_page_token: Option<String>,
}

/// Remote collaborator used by the scanner and the executor.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// One page of the direct, non-trashed children of `folder_id`.
    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<RemotePage, RemoteError>;

    /// Returns the id of the child folder `name`, creating it when absent.
    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, RemoteError>;

    async fn upload(
        &self,
        source: &Path,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteEntry, RemoteError>;

    /// Replaces the content of an existing file.
    async fn update(&self, remote_id: &str, source: &Path) -> Result<RemoteEntry, RemoteError>;

    /// Writes the content (or the export in `export_mime`) to `dest`.
    async fn download(
        &self,
        remote_id: &str,
        export_mime: Option<&str>,
        expected_md5: Option<&str>,
        dest: &Path,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, remote_id: &str) -> Result<(), RemoteError>;

    async fn rename(
        &self,
        remote_id: &str,
        new_parent: Option<(&str, &str)>,
        new_name: Option<&str>,
    ) -> Result<RemoteEntry, RemoteError>;
}

/// All children of `folder_id` as one lazy sequence, fetching pages on demand.
/// Each page fetch is retried under `policy`.
pub fn list_children<'a>(
    remote: &'a dyn RemoteStore,
    folder_id: &'a str,
    policy: &'a RetryPolicy,
) -> impl Stream<Item = Result<RemoteEntry, RemoteError>> + Send + 'a {
    stream::try_unfold(Some(None::<String>), move |state| async move {
        let Some(page_token) = state else {
            return Ok::<_, RemoteError>(None);
        };
        let page = retry(policy, "list", || remote.list_page(folder_id, page_token.as_deref()))
            .await?;
        let next = page.next_page_token.filter(|t| !t.is_empty()).map(Some);
        Ok(Some((page.entries, next)))
    })
    .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<_, RemoteError>)))
    .try_flatten()
}
