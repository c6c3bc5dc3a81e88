//! In-memory `RemoteStore` with failure injection, for engine tests.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::remote::{RemoteEntry, RemoteError, RemotePage, RemoteStore};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const PAGE_SIZE: usize = 2;

#[derive(Debug, Clone)]
struct Item {
    id: String,
    name: String,
    parent: String,
    mime_type: String,
    content: Vec<u8>,
    modified: String,
    trashed: bool,
}

impl Item {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    fn is_native(&self) -> bool {
        self.mime_type.starts_with("application/vnd.google-apps.")
    }

    fn entry(&self) -> RemoteEntry {
        RemoteEntry {
            id: self.id.clone(),
            name: self.name.clone(),
            parent_id: Some(self.parent.clone()),
            is_folder: self.is_folder(),
            mime_type: self.mime_type.clone(),
            md5: (!self.is_native()).then(|| format!("{:x}", md5::compute(&self.content))),
            size: (!self.is_folder()).then_some(self.content.len() as u64),
            modified_time: Some(self.modified.clone()),
        }
    }
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    items: BTreeMap<String, Item>,
    listing_error: Option<RemoteError>,
    transient_listings: u32,
    transient_uploads: u32,
    failing_names: HashSet<String>,
    auth_failing_names: HashSet<String>,
    calls: Vec<String>,
}

pub(crate) struct MemoryRemote {
    inner: Mutex<Inner>,
}

pub(crate) fn rfc3339(secs: i64) -> String {
    OffsetDateTime::from_unix_timestamp(secs)
        .unwrap()
        .format(&Rfc3339)
        .unwrap()
}

impl MemoryRemote {
    pub const ROOT: &'static str = "root-id";

    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Creates or overwrites the file at `rel`, creating folders on the way.
    pub fn put_file(&self, rel: &str, content: &[u8], modified_at: i64) -> String {
        let mut inner = self.inner.lock().unwrap();
        let (parent, name) = inner.ensure_parents(rel);
        if let Some(existing) = inner.find_child(&parent, &name) {
            let item = inner.items.get_mut(&existing).unwrap();
            item.content = content.to_vec();
            item.modified = rfc3339(modified_at);
            return existing;
        }
        inner.insert(&parent, &name, "text/plain", content, rfc3339(modified_at))
    }

    /// Adds another file with the same name as an existing one.
    pub fn put_duplicate(&self, rel: &str, content: &[u8], modified_at: i64) -> String {
        let mut inner = self.inner.lock().unwrap();
        let (parent, name) = inner.ensure_parents(rel);
        inner.insert(&parent, &name, "text/plain", content, rfc3339(modified_at))
    }

    pub fn put_native(&self, name: &str, mime_type: &str, modified: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(
            Self::ROOT,
            name,
            mime_type,
            format!("exported:{name}").as_bytes(),
            modified.to_string(),
        )
    }

    /// Simulates a deletion made by another client.
    pub fn remove(&self, rel: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.resolve(rel) {
            inner.items.get_mut(&id).unwrap().trashed = true;
        }
    }

    pub fn content(&self, rel: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let id = inner.resolve(rel)?;
        Some(inner.items[&id].content.clone())
    }

    pub fn id_of(&self, rel: &str) -> Option<String> {
        self.inner.lock().unwrap().resolve(rel)
    }

    /// Relative paths of every live file.
    pub fn files(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<String> = inner
            .items
            .values()
            .filter(|item| !item.trashed && !item.is_folder())
            .filter_map(|item| inner.path_of(&item.id))
            .collect();
        out.sort();
        out
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn fail_listing(&self, err: RemoteError) {
        self.inner.lock().unwrap().listing_error = Some(err);
    }

    pub fn fail_next_listings(&self, count: u32) {
        self.inner.lock().unwrap().transient_listings = count;
    }

    pub fn fail_next_uploads(&self, count: u32) {
        self.inner.lock().unwrap().transient_uploads = count;
    }

    /// Every transfer touching a file with this name fails permanently.
    pub fn fail_name(&self, name: &str) {
        self.inner.lock().unwrap().failing_names.insert(name.to_string());
    }

    pub fn heal_name(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.failing_names.remove(name);
        inner.auth_failing_names.remove(name);
    }

    /// Every transfer touching a file with this name is rejected as unauthorized.
    pub fn reject_name(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .auth_failing_names
            .insert(name.to_string());
    }
}

impl Inner {
    fn insert(
        &mut self,
        parent: &str,
        name: &str,
        mime_type: &str,
        content: &[u8],
        modified: String,
    ) -> String {
        self.next_id += 1;
        let id = format!("id-{}", self.next_id);
        self.items.insert(
            id.clone(),
            Item {
                id: id.clone(),
                name: name.to_string(),
                parent: parent.to_string(),
                mime_type: mime_type.to_string(),
                content: content.to_vec(),
                modified,
                trashed: false,
            },
        );
        id
    }

    fn find_child(&self, parent: &str, name: &str) -> Option<String> {
        self.items
            .values()
            .find(|item| !item.trashed && item.parent == parent && item.name == name)
            .map(|item| item.id.clone())
    }

    fn ensure_parents(&mut self, rel: &str) -> (String, String) {
        let mut parts: Vec<&str> = rel.split('/').collect();
        let name = parts.pop().unwrap_or_default().to_string();
        let mut parent = MemoryRemote::ROOT.to_string();
        for part in parts {
            parent = match self.find_child(&parent, part) {
                Some(id) => id,
                None => self.insert(&parent, part, FOLDER_MIME, b"", rfc3339(0)),
            };
        }
        (parent, name)
    }

    fn resolve(&self, rel: &str) -> Option<String> {
        let mut current = MemoryRemote::ROOT.to_string();
        for part in rel.split('/') {
            current = self.find_child(&current, part)?;
        }
        Some(current)
    }

    fn path_of(&self, id: &str) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = self.items.get(id)?;
        loop {
            parts.push(current.name.clone());
            if current.parent == MemoryRemote::ROOT {
                break;
            }
            current = self.items.get(&current.parent)?;
        }
        parts.reverse();
        Some(parts.join("/"))
    }

    fn check_transfer(&mut self, name: &str) -> Result<(), RemoteError> {
        if self.auth_failing_names.contains(name) {
            return Err(RemoteError::Unauthorized("token revoked".into()));
        }
        if self.failing_names.contains(name) {
            return Err(RemoteError::Permanent(format!("{name} rejected")));
        }
        Ok(())
    }

    fn live(&self, id: &str) -> Result<&Item, RemoteError> {
        self.items
            .get(id)
            .filter(|item| !item.trashed)
            .ok_or(RemoteError::NotFound)
    }
}

fn now() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap()
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<RemotePage, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("list {folder_id}"));
        if let Some(err) = inner.listing_error.take() {
            return Err(err);
        }
        if inner.transient_listings > 0 {
            inner.transient_listings -= 1;
            return Err(RemoteError::Transient("listing timed out".into()));
        }

        let mut children: Vec<&Item> = inner
            .items
            .values()
            .filter(|item| !item.trashed && item.parent == folder_id)
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let entries: Vec<RemoteEntry> = children
            .iter()
            .skip(offset)
            .take(PAGE_SIZE)
            .map(|item| item.entry())
            .collect();
        let next = offset + PAGE_SIZE;
        Ok(RemotePage {
            entries,
            next_page_token: (next < children.len()).then(|| next.to_string()),
        })
    }

    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("ensure_folder {name}"));
        if let Some(id) = inner.find_child(parent_id, name) {
            return Ok(id);
        }
        Ok(inner.insert(parent_id, name, FOLDER_MIME, b"", now()))
    }

    async fn upload(
        &self,
        source: &Path,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteEntry, RemoteError> {
        let content = std::fs::read(source)?;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("upload {name}"));
        inner.check_transfer(name)?;
        if inner.transient_uploads > 0 {
            inner.transient_uploads -= 1;
            return Err(RemoteError::RateLimited { retry_after: None });
        }
        let id = inner.insert(parent_id, name, "text/plain", &content, now());
        Ok(inner.items[&id].entry())
    }

    async fn update(&self, remote_id: &str, source: &Path) -> Result<RemoteEntry, RemoteError> {
        let content = std::fs::read(source)?;
        let mut inner = self.inner.lock().unwrap();
        let name = inner.live(remote_id)?.name.clone();
        inner.calls.push(format!("update {name}"));
        inner.check_transfer(&name)?;
        if inner.transient_uploads > 0 {
            inner.transient_uploads -= 1;
            return Err(RemoteError::RateLimited { retry_after: None });
        }
        let item = inner.items.get_mut(remote_id).unwrap();
        item.content = content;
        item.modified = now();
        Ok(item.entry())
    }

    async fn download(
        &self,
        remote_id: &str,
        _export_mime: Option<&str>,
        expected_md5: Option<&str>,
        dest: &Path,
    ) -> Result<(), RemoteError> {
        let content = {
            let mut inner = self.inner.lock().unwrap();
            let item = inner.live(remote_id)?.clone();
            inner.calls.push(format!("download {}", item.name));
            inner.check_transfer(&item.name)?;
            item.content
        };
        if let Some(expected) = expected_md5 {
            assert_eq!(expected, format!("{:x}", md5::compute(&content)));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, content)?;
        Ok(())
    }

    async fn delete(&self, remote_id: &str) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        let name = inner.live(remote_id)?.name.clone();
        inner.calls.push(format!("delete {name}"));
        inner.items.get_mut(remote_id).unwrap().trashed = true;
        Ok(())
    }

    async fn rename(
        &self,
        remote_id: &str,
        new_parent: Option<(&str, &str)>,
        new_name: Option<&str>,
    ) -> Result<RemoteEntry, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.live(remote_id)?;
        inner.calls.push(format!("rename {remote_id}"));
        let item = inner.items.get_mut(remote_id).unwrap();
        if let Some((add, _)) = new_parent {
            item.parent = add.to_string();
        }
        if let Some(name) = new_name {
            item.name = name.to_string();
        }
        Ok(item.entry())
    }
}
