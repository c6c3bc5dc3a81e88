use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use tokio::sync::Mutex;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("persisted state is corrupt: {0}")]
    Corrupt(String),
}

impl StateError {
    /// The database file itself is unreadable (not a database, or damaged pages).
    fn is_corruption(&self) -> bool {
        let sqlx_err = match self {
            StateError::Sqlx(err) => err,
            StateError::Migration(sqlx::migrate::MigrateError::Execute(err)) => err,
            StateError::Corrupt(_) => return true,
            _ => return false,
        };
        let sqlx::Error::Database(db) = sqlx_err else {
            return false;
        };
        db.code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 11 | 26))
    }
}

/// Last-synchronized state of one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineEntry {
    /// Local content hash at the last sync.
    pub fingerprint: String,
    /// Remote change token at the last sync; equals `fingerprint` for plain files.
    pub remote_fingerprint: String,
    pub remote_id: Option<String>,
    pub modified_at: i64,
    pub size: u64,
}

/// Immutable view of the baseline, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    entries: BTreeMap<String, BaselineEntry>,
}

impl SyncState {
    pub fn get(&self, path: &str) -> Option<&BaselineEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BaselineEntry)> {
        self.entries.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

impl FromIterator<(String, BaselineEntry)> for SyncState {
    fn from_iter<I: IntoIterator<Item = (String, BaselineEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub id: i64,
    pub path: String,
    pub local_copy: Option<String>,
    pub remote_copy: Option<String>,
    pub reason: String,
    pub created: i64,
}

/// Durable baseline. Writes are serialized through `write_lock`; every
/// commit/remove is its own SQLite transaction.
pub struct StateStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    /// Opens the store, moving an unreadable database aside and starting empty.
    pub async fn open_or_recover(path: &Path) -> Result<Self, StateError> {
        match Self::open(path).await {
            Ok(store) => Ok(store),
            Err(err) if err.is_corruption() => {
                let aside = corrupt_sidecar(path);
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %err,
                    "sync state is corrupt; starting from an empty baseline"
                );
                tokio::fs::rename(path, &aside).await?;
                for suffix in ["-wal", "-shm"] {
                    let _ = tokio::fs::remove_file(sidecar(path, suffix)).await;
                }
                Self::open(path).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn init(&self) -> Result<(), StateError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn load(&self) -> Result<SyncState, StateError> {
        let rows = sqlx::query(
            "SELECT path, fingerprint, remote_fingerprint, remote_id, modified_at, size FROM baseline ORDER BY path ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = BTreeMap::new();
        for row in rows {
            let (path, entry) = decode_entry(&row)?;
            entries.insert(path, entry);
        }
        Ok(SyncState { entries })
    }

    /// `load`, treating undecodable rows as an empty baseline (and clearing them).
    pub async fn load_or_reset(&self) -> Result<SyncState, StateError> {
        match self.load().await {
            Ok(state) => Ok(state),
            Err(err) if err.is_corruption() => {
                tracing::warn!(error = %err, "baseline is unreadable; treating it as empty");
                self.reset().await?;
                Ok(SyncState::default())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Option<BaselineEntry>, StateError> {
        let row = sqlx::query(
            "SELECT path, fingerprint, remote_fingerprint, remote_id, modified_at, size FROM baseline WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| decode_entry(&row).map(|(_, entry)| entry))
            .transpose()
    }

    pub async fn commit(&self, path: &str, entry: &BaselineEntry) -> Result<(), StateError> {
        let size = i64::try_from(entry.size)
            .map_err(|_| StateError::Corrupt(format!("size out of range for {path}")))?;
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO baseline (path, fingerprint, remote_fingerprint, remote_id, modified_at, size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                remote_fingerprint = excluded.remote_fingerprint,
                remote_id = excluded.remote_id,
                modified_at = excluded.modified_at,
                size = excluded.size",
        )
        .bind(path)
        .bind(&entry.fingerprint)
        .bind(&entry.remote_fingerprint)
        .bind(&entry.remote_id)
        .bind(entry.modified_at)
        .bind(size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM baseline WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn reset(&self) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM baseline")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records a conflict once; an identical unresolved record is not duplicated.
    pub async fn record_conflict(
        &self,
        path: &str,
        local_copy: Option<&str>,
        remote_copy: Option<&str>,
        reason: &str,
        created: i64,
    ) -> Result<bool, StateError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "INSERT INTO conflicts (path, local_copy, remote_copy, reason, created)
             SELECT ?1, ?2, ?3, ?4, ?5
             WHERE NOT EXISTS (
                SELECT 1 FROM conflicts
                WHERE path = ?1 AND local_copy IS ?2 AND remote_copy IS ?3 AND reason = ?4
             )",
        )
        .bind(path)
        .bind(local_copy)
        .bind(remote_copy)
        .bind(reason)
        .bind(created)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>, StateError> {
        let rows = sqlx::query(
            "SELECT id, path, local_copy, remote_copy, reason, created FROM conflicts ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ConflictRecord {
                id: row.try_get("id")?,
                path: row.try_get("path")?,
                local_copy: row.try_get("local_copy")?,
                remote_copy: row.try_get("remote_copy")?,
                reason: row.try_get("reason")?,
                created: row.try_get("created")?,
            });
        }
        Ok(out)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_entry(row: &SqliteRow) -> Result<(String, BaselineEntry), StateError> {
    let path: String = row.try_get("path")?;
    let size: i64 = row.try_get("size")?;
    let size = u64::try_from(size)
        .map_err(|_| StateError::Corrupt(format!("negative size recorded for {path}")))?;
    let fingerprint: String = row.try_get("fingerprint")?;
    if fingerprint.is_empty() {
        return Err(StateError::Corrupt(format!("empty fingerprint for {path}")));
    }
    Ok((
        path,
        BaselineEntry {
            fingerprint,
            remote_fingerprint: row.try_get("remote_fingerprint")?,
            remote_id: row.try_get("remote_id")?,
            modified_at: row.try_get("modified_at")?,
            size,
        },
    ))
}

/// Per sync-pair database under the XDG data directory.
pub fn default_state_path(local_root: &Path, remote_target: &str) -> Result<PathBuf, StateError> {
    let mut hasher = Sha256::new();
    hasher.update(local_root.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(remote_target.as_bytes());
    let digest = hasher.finalize();
    let key: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();

    let mut path = dirs::data_dir().ok_or(StateError::MissingDataDir)?;
    path.push("drive-sync");
    path.push(format!("{key}.db"));
    Ok(path)
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn corrupt_sidecar(path: &Path) -> PathBuf {
    sidecar(path, &format!(".corrupt-{}", now_unix()))
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
