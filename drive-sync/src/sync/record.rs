use std::fmt;

/// Observed state of one file on one side of the sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub relative_path: String,
    /// Content hash (md5 hex) or, for exported documents, a `rev:` change token.
    pub fingerprint: String,
    pub size: u64,
    /// Unix seconds. Advisory only; never used to decide whether content changed.
    pub modified_at: i64,
    pub remote_id: Option<String>,
    pub is_directory: bool,
    /// Remote only: id of the containing folder.
    pub parent_id: Option<String>,
    /// Remote only: set for Google-native documents that must be exported.
    pub export_mime: Option<String>,
}

impl FileRecord {
    pub fn local(relative_path: String, fingerprint: String, size: u64, modified_at: i64) -> Self {
        Self {
            relative_path,
            fingerprint,
            size,
            modified_at,
            remote_id: None,
            is_directory: false,
            parent_id: None,
            export_mime: None,
        }
    }

    pub fn is_exported(&self) -> bool {
        self.export_mime.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => f.write_str("local"),
            Side::Remote => f.write_str("remote"),
        }
    }
}

/// A path a scanner could not observe; it is excluded from classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPath {
    pub side: Side,
    pub path: String,
    pub reason: String,
}
