use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::StreamExt;
use gdrive_core::{DriveClient, DriveError, DriveFile};
use md5::Context;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Api(#[from] DriveError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Request(err) => {
                err.is_timeout() || err.is_connect() || err.is_body() || err.is_decode()
            }
            TransferError::Api(err) => err.is_retryable(),
            TransferError::IntegrityMismatch { .. } => true,
            TransferError::Io(_) | TransferError::ConcurrencyClosed => false,
        }
    }
}

/// Streams file bodies to and from Drive, bounding concurrent transfers per direction.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 2;

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
        }
    }
}

impl TransferClient {
    pub fn new() -> Self {
        Self::from_config(TransferConfig::default())
    }

    pub fn from_config(config: TransferConfig) -> Self {
        Self::with_config(Client::new(), config)
    }

    pub fn with_config(http: Client, config: TransferConfig) -> Self {
        Self {
            http,
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Downloads `url` into `target` via a sibling `.partial` file. The target is
    /// only replaced once the body is flushed, synced and (when given) md5-verified.
    pub async fn download_to_path_checked(
        &self,
        url: Url,
        auth_header: &str,
        target: &Path,
        expected_md5: Option<&str>,
    ) -> Result<(), TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let response = self
            .http
            .get(url)
            .header("Authorization", auth_header)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DriveClient::api_error(response).await.into());
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let result = write_body(response, &partial, expected_md5).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        result?;

        tokio::fs::rename(&partial, target).await?;
        Ok(())
    }

    /// Sends the content of `source` to an open resumable session.
    pub async fn upload_to_session(
        &self,
        session: &Url,
        source: &Path,
    ) -> Result<DriveFile, TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let file = tokio::fs::File::open(source).await?;
        let len = file.metadata().await?.len();
        let stream = ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);
        let response = self
            .http
            .put(session.clone())
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DriveClient::api_error(response).await.into());
        }
        Ok(response.json::<DriveFile>().await?)
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_body(
    response: reqwest::Response,
    partial: &Path,
    expected_md5: Option<&str>,
) -> Result<(), TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut md5 = Context::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        md5.consume(&chunk);
    }

    file.flush().await?;
    file.sync_all().await?;

    if let Some(expected_md5) = expected_md5 {
        let actual_md5 = format!("{:x}", md5.compute());
        let expected_md5 = expected_md5.to_ascii_lowercase();
        if actual_md5 != expected_md5 {
            return Err(TransferError::IntegrityMismatch {
                expected_md5,
                actual_md5,
            });
        }
    }
    Ok(())
}

pub(crate) fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn limits_come_from_config() {
        let client = TransferClient::from_config(TransferConfig {
            download_concurrency: 7,
            upload_concurrency: 0,
        });
        assert_eq!(client.download_limit.available_permits(), 7);
        assert_eq!(client.upload_limit.available_permits(), 1);

        let defaults = TransferClient::new();
        assert_eq!(
            defaults.download_limit.available_permits(),
            DEFAULT_DOWNLOAD_CONCURRENCY
        );
        assert_eq!(defaults.upload_limit.available_permits(), DEFAULT_UPLOAD_CONCURRENCY);
    }

    fn url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{p}", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn downloads_file_to_target_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .and(header("Authorization", "Bearer t"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/out.txt");
        let client = TransferClient::new();

        client
            .download_to_path_checked(
                url(&server, "/file"),
                "Bearer t",
                &target,
                Some("5d41402abc4b2a76b9719d911017c592"),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn md5_mismatch_leaves_existing_target_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("bad.txt");
        std::fs::write(&target, b"original").unwrap();
        let client = TransferClient::new();

        let err = client
            .download_to_path_checked(url(&server, "/file"), "Bearer t", &target, Some("deadbeef"))
            .await
            .expect_err("expected md5 mismatch");

        assert!(matches!(err, TransferError::IntegrityMismatch { .. }));
        assert!(err.is_retryable());
        assert_eq!(std::fs::read(&target).unwrap(), b"original");
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn error_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let client = TransferClient::new();
        let err = client
            .download_to_path_checked(url(&server, "/file"), "Bearer t", &dir.path().join("x"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Api(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn uploads_file_contents_to_session() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/session"))
            .and(body_bytes(b"payload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "f1",
                "name": "in.bin",
                "mimeType": "application/octet-stream",
                "md5Checksum": "321c3cf486ed509164edec1e1981fec8",
                "size": "7",
                "parents": ["p"]
            })))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        std::fs::write(&source, b"payload").unwrap();

        let client = TransferClient::new();
        let file = client
            .upload_to_session(&url(&server, "/session"), &source)
            .await
            .unwrap();
        assert_eq!(file.id, "f1");
        assert_eq!(file.size, Some(7));
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/a/b/report.pdf")),
            PathBuf::from("/a/b/report.pdf.partial")
        );
    }
}
