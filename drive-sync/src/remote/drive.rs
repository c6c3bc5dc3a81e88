use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use gdrive_core::{DriveClient, DriveFile};
use reqwest::Client;
use tokio::sync::Mutex;

use super::{RemoteEntry, RemoteError, RemotePage, RemoteStore};
use crate::credentials::CredentialProvider;
use crate::sync::transfer::TransferClient;

const DRIVE_BASE_URL: &str = "https://www.googleapis.com";
const DEFAULT_PAGE_SIZE: u32 = 1000;

/// `RemoteStore` backed by the Google Drive v3 API.
pub struct DriveRemote {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    transfer: TransferClient,
    page_size: u32,
    folder_lock: Mutex<()>,
}

impl DriveRemote {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self::with_base_url(DRIVE_BASE_URL, credentials, TransferClient::new())
    }

    pub fn with_base_url(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
        transfer: TransferClient,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.to_string(),
            credentials,
            transfer,
            page_size: DEFAULT_PAGE_SIZE,
            folder_lock: Mutex::new(()),
        }
    }

    pub fn with_transfer(mut self, transfer: TransferClient) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn client(&self) -> Result<DriveClient, RemoteError> {
        let token = self.credentials.valid_token().await?;
        Ok(DriveClient::with_http(
            self.http.clone(),
            &self.base_url,
            token,
        )?)
    }

    /// Resolves "/A/B" under My Drive to a folder id, creating missing folders.
    pub async fn resolve_folder_path(&self, path: &str) -> Result<String, RemoteError> {
        let mut current = "root".to_string();
        for name in path.split('/').filter(|part| !part.is_empty()) {
            current = self.ensure_folder(&current, name).await?;
        }
        Ok(current)
    }
}

impl From<DriveFile> for RemoteEntry {
    fn from(file: DriveFile) -> Self {
        Self {
            is_folder: file.is_folder(),
            parent_id: file.parents.first().cloned(),
            id: file.id,
            name: file.name,
            mime_type: file.mime_type,
            md5: file.md5_checksum,
            size: file.size,
            modified_time: file.modified_time,
        }
    }
}

#[async_trait]
impl RemoteStore for DriveRemote {
    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<RemotePage, RemoteError> {
        let client = self.client().await?;
        let query = format!(
            "'{}' in parents and trashed = false",
            folder_id.replace('\\', "\\\\").replace('\'', "\\'")
        );
        let page = client
            .list_page(&query, self.page_size, page_token)
            .await?;
        Ok(RemotePage {
            entries: page
                .files
                .into_iter()
                .filter(|file| !file.trashed)
                .map(RemoteEntry::from)
                .collect(),
            next_page_token: page.next_page_token,
        })
    }

    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, RemoteError> {
        let _guard = self.folder_lock.lock().await;
        let client = self.client().await?;
        if let Some(existing) = client.find_child_folder(parent_id, name).await? {
            return Ok(existing.id);
        }
        let created = client.create_folder(parent_id, name).await?;
        tracing::info!(parent = %parent_id, name = %name, id = %created.id, "created remote folder");
        Ok(created.id)
    }

    async fn upload(
        &self,
        source: &Path,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteEntry, RemoteError> {
        let client = self.client().await?;
        let session = client.start_upload(parent_id, name).await?;
        let file = self.transfer.upload_to_session(&session.url, source).await?;
        Ok(file.into())
    }

    async fn update(&self, remote_id: &str, source: &Path) -> Result<RemoteEntry, RemoteError> {
        let client = self.client().await?;
        let session = client.start_update(remote_id).await?;
        let file = self.transfer.upload_to_session(&session.url, source).await?;
        Ok(file.into())
    }

    async fn download(
        &self,
        remote_id: &str,
        export_mime: Option<&str>,
        expected_md5: Option<&str>,
        dest: &Path,
    ) -> Result<(), RemoteError> {
        let client = self.client().await?;
        let url = match export_mime {
            Some(mime) => client.export_url(remote_id, mime)?,
            None => client.media_url(remote_id)?,
        };
        self.transfer
            .download_to_path_checked(url, &client.auth_header_value(), dest, expected_md5)
            .await?;
        Ok(())
    }

    async fn delete(&self, remote_id: &str) -> Result<(), RemoteError> {
        let client = self.client().await?;
        client.trash_file(remote_id).await?;
        Ok(())
    }

    async fn rename(
        &self,
        remote_id: &str,
        new_parent: Option<(&str, &str)>,
        new_name: Option<&str>,
    ) -> Result<RemoteEntry, RemoteError> {
        let client = self.client().await?;
        Ok(client.move_file(remote_id, new_parent, new_name).await?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticToken;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_bytes, body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote(server: &MockServer) -> DriveRemote {
        DriveRemote::with_base_url(
            &server.uri(),
            Arc::new(StaticToken::new("t")),
            TransferClient::new(),
        )
        .with_page_size(2)
    }

    fn folder_query(parent: &str, name: &str) -> String {
        format!(
            "name = '{name}' and mimeType = 'application/vnd.google-apps.folder' and '{parent}' in parents and trashed = false"
        )
    }

    #[tokio::test]
    async fn list_page_maps_drive_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(header("Authorization", "Bearer t"))
            .and(query_param("q", "'folder-1' in parents and trashed = false"))
            .and(query_param("pageSize", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "nextPageToken": "p2",
                "files": [
                    {"id": "a", "name": "a.txt", "mimeType": "text/plain",
                     "md5Checksum": "h1", "size": "5", "parents": ["folder-1"],
                     "modifiedTime": "2024-01-01T00:00:00.000Z"},
                    {"id": "d", "name": "Docs", "mimeType": "application/vnd.google-apps.folder",
                     "parents": ["folder-1"]}
                ]
            })))
            .mount(&server)
            .await;

        let page = remote(&server).list_page("folder-1", None).await.unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("p2"));
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].md5.as_deref(), Some("h1"));
        assert_eq!(page.entries[0].size, Some(5));
        assert_eq!(page.entries[0].parent_id.as_deref(), Some("folder-1"));
        assert!(page.entries[1].is_folder);
    }

    #[tokio::test]
    async fn resolve_folder_path_reuses_and_creates_folders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("q", folder_query("root", "FileSync")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "files": [{"id": "fs", "name": "FileSync",
                           "mimeType": "application/vnd.google-apps.folder"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("q", folder_query("fs", "Work")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"files": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drive/v3/files"))
            .and(body_partial_json(json!({"name": "Work", "parents": ["fs"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "work", "name": "Work",
                "mimeType": "application/vnd.google-apps.folder"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let id = remote(&server)
            .resolve_folder_path("/FileSync/Work/")
            .await
            .unwrap();
        assert_eq!(id, "work");
    }

    #[tokio::test]
    async fn upload_streams_into_resumable_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .and(query_param("uploadType", "resumable"))
            .and(body_partial_json(json!({"name": "a.txt", "parents": ["p"]})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Location", format!("{}/session/1", server.uri()).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/session/1"))
            .and(body_bytes(b"hello"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "new", "name": "a.txt", "mimeType": "text/plain",
                "md5Checksum": "5d41402abc4b2a76b9719d911017c592", "size": "5",
                "parents": ["p"]
            })))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"hello").unwrap();

        let entry = remote(&server).upload(&source, "p", "a.txt").await.unwrap();
        assert_eq!(entry.id, "new");
        assert_eq!(
            entry.md5.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }

    #[tokio::test]
    async fn download_uses_export_endpoint_for_documents() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/doc/export"))
            .and(header("Authorization", "Bearer t"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"docx-bytes"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("Report.docx");
        remote(&server)
            .download("doc", Some("application/x-test"), None, &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), b"docx-bytes");
    }

    #[tokio::test]
    async fn delete_moves_file_to_drive_trash() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/drive/v3/files/f1"))
            .and(body_partial_json(json!({"trashed": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "f1", "name": "a.txt", "mimeType": "text/plain", "trashed": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        remote(&server).delete("f1").await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/drive/v3/files/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = remote(&server).delete("gone").await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound));
    }
}
