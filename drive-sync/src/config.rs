use std::path::{Path, PathBuf};

use clap::Parser;
use thiserror::Error;

use crate::sync::backoff::RetryPolicy;
use crate::sync::conflict::{ConflictPolicy, SyncDirection};
use crate::sync::executor::LocalDeleteMode;
use crate::sync::orchestrator::PassOptions;
use crate::sync::paths::{IgnoreRules, PathError};
use crate::sync::state::{StateError, default_state_path};
use crate::sync::transfer::{
    DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_UPLOAD_CONCURRENCY, TransferConfig,
};

const DEFAULT_REMOTE_PATH: &str = "/FileSync";
const APP_DIR_NAME: &str = "drive-sync";

/// Two-way synchronization between a local directory and a Google Drive folder
#[derive(Parser, Debug, Clone)]
#[command(name = "drive-sync")]
#[command(about, long_about = None, version)]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Local directory to synchronize
    #[arg(env = "DRIVE_SYNC_LOCAL_ROOT", value_name = "DIR")]
    pub local_root: PathBuf,

    /// Folder path under My Drive; missing folders are created
    #[arg(long, env = "DRIVE_SYNC_REMOTE_PATH", default_value = DEFAULT_REMOTE_PATH)]
    pub remote_path: String,

    /// Drive folder id; takes precedence over --remote-path
    #[arg(long, env = "DRIVE_SYNC_REMOTE_FOLDER_ID", value_name = "ID")]
    pub remote_folder_id: Option<String>,

    /// Sync into <remote path>/<host name> so several machines can share one folder
    #[arg(long, env = "DRIVE_SYNC_PER_HOST", conflicts_with = "remote_folder_id")]
    pub per_host: bool,

    /// Host name used by --per-host (default: the system host name)
    #[arg(long, env = "DRIVE_SYNC_HOST_NAME", value_name = "NAME")]
    pub host_name: Option<String>,

    /// Which side a pass may change
    #[arg(long, env = "DRIVE_SYNC_DIRECTION", value_enum, default_value_t = SyncDirection::Auto)]
    pub sync_direction: SyncDirection,

    /// How paths changed on both sides are resolved
    #[arg(long, env = "DRIVE_SYNC_POLICY", value_enum, default_value_t = ConflictPolicy::NewerWins)]
    pub policy: ConflictPolicy,

    /// Print the planned actions without executing them
    #[arg(long, env = "DRIVE_SYNC_DRY_RUN")]
    pub dry_run: bool,

    /// Extra gitignore-style pattern to exclude (repeatable)
    #[arg(long = "ignore", value_name = "GLOB")]
    pub ignore: Vec<String>,

    /// Maximum number of actions executed concurrently
    #[arg(long, env = "DRIVE_SYNC_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Maximum number of downloads streaming at once
    #[arg(long, env = "DRIVE_SYNC_DOWNLOAD_CONCURRENCY", default_value_t = DEFAULT_DOWNLOAD_CONCURRENCY)]
    pub download_concurrency: usize,

    /// Maximum number of uploads streaming at once
    #[arg(long, env = "DRIVE_SYNC_UPLOAD_CONCURRENCY", default_value_t = DEFAULT_UPLOAD_CONCURRENCY)]
    pub upload_concurrency: usize,

    /// Attempts per remote call before giving up
    #[arg(long, env = "DRIVE_SYNC_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// Baseline database (default: one per sync pair under the data directory)
    #[arg(long, env = "DRIVE_SYNC_STATE_DB", value_name = "PATH")]
    pub state_db: Option<PathBuf>,

    /// Directory holding credentials.json and token.json
    #[arg(long, env = "DRIVE_SYNC_CONFIG_DIR", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// OAuth token file (default: <config dir>/token.json)
    #[arg(long, env = "DRIVE_SYNC_TOKEN_PATH", value_name = "PATH")]
    pub token_path: Option<PathBuf>,

    /// OAuth client secrets (default: <config dir>/credentials.json)
    #[arg(long, env = "DRIVE_SYNC_CREDENTIALS_PATH", value_name = "PATH")]
    pub credentials_path: Option<PathBuf>,

    /// Use this access token as-is instead of the token file
    #[arg(long, env = "DRIVE_SYNC_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// What happens to local files deleted on the remote side
    #[arg(long, env = "DRIVE_SYNC_LOCAL_DELETE", value_enum, default_value_t = LocalDeleteMode::Trash)]
    pub local_delete: LocalDeleteMode,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("local root {0} does not exist")]
    LocalRootMissing(PathBuf),
    #[error("local root {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to resolve local root {path}: {source}")]
    LocalRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("--workers must be at least 1")]
    NoWorkers,
    #[error("--max-attempts must be at least 1")]
    NoAttempts,
    #[error("--download-concurrency and --upload-concurrency must be at least 1")]
    NoTransferSlots,
    #[error("--per-host needs a host name; set --host-name")]
    NoHostName,
    #[error("remote folder id is empty")]
    EmptyFolderId,
    #[error("config directory is unavailable")]
    NoConfigDir,
    #[error("invalid ignore pattern: {0}")]
    Ignore(#[from] PathError),
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    /// Slash path under My Drive, normalized to "/A/B" ("/" is My Drive itself).
    Path(String),
    FolderId(String),
}

impl RemoteTarget {
    /// Stable key used to derive the per-pair state database name.
    pub fn key(&self) -> String {
        match self {
            RemoteTarget::Path(path) => format!("path:{path}"),
            RemoteTarget::FolderId(id) => format!("id:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSource {
    AccessToken(String),
    TokenFile {
        token_path: PathBuf,
        credentials_path: PathBuf,
    },
}

/// Validated settings; nothing below this point reads the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub local_root: PathBuf,
    pub remote: RemoteTarget,
    pub policy: ConflictPolicy,
    pub direction: SyncDirection,
    pub dry_run: bool,
    pub ignore: IgnoreRules,
    pub workers: usize,
    pub transfer: TransferConfig,
    pub max_attempts: u32,
    pub state_db: PathBuf,
    pub auth: AuthSource,
    pub local_delete: LocalDeleteMode,
    pub verbose: bool,
}

impl SyncConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let local_root = resolve_local_root(&cli.local_root)?;
        if cli.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if cli.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if cli.download_concurrency == 0 || cli.upload_concurrency == 0 {
            return Err(ConfigError::NoTransferSlots);
        }

        let remote = match cli.remote_folder_id {
            Some(id) if id.trim().is_empty() => return Err(ConfigError::EmptyFolderId),
            Some(id) => RemoteTarget::FolderId(id.trim().to_string()),
            None if cli.per_host => {
                let host = host_segment(cli.host_name.as_deref())?;
                RemoteTarget::Path(normalize_remote_path(&format!("{}/{host}", cli.remote_path)))
            }
            None => RemoteTarget::Path(normalize_remote_path(&cli.remote_path)),
        };
        let ignore = IgnoreRules::with_defaults(cli.ignore.as_slice())?;

        let state_db = match cli.state_db {
            Some(path) => path,
            None => default_state_path(&local_root, &remote.key())?,
        };

        let auth = match cli.access_token.filter(|token| !token.trim().is_empty()) {
            Some(token) => AuthSource::AccessToken(token.trim().to_string()),
            None => {
                let config_dir = match cli.config_dir {
                    Some(dir) => dir,
                    None => dirs::config_dir()
                        .ok_or(ConfigError::NoConfigDir)?
                        .join(APP_DIR_NAME),
                };
                AuthSource::TokenFile {
                    token_path: cli
                        .token_path
                        .unwrap_or_else(|| config_dir.join("token.json")),
                    credentials_path: cli
                        .credentials_path
                        .unwrap_or_else(|| config_dir.join("credentials.json")),
                }
            }
        };

        Ok(Self {
            local_root,
            remote,
            policy: cli.policy,
            direction: cli.sync_direction,
            dry_run: cli.dry_run,
            ignore,
            workers: cli.workers,
            transfer: TransferConfig {
                download_concurrency: cli.download_concurrency,
                upload_concurrency: cli.upload_concurrency,
            },
            max_attempts: cli.max_attempts,
            state_db,
            auth,
            local_delete: cli.local_delete,
            verbose: cli.verbose,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }

    pub fn pass_options(&self) -> PassOptions {
        PassOptions {
            local_root: self.local_root.clone(),
            policy: self.policy,
            direction: self.direction,
            dry_run: self.dry_run,
            workers: self.workers,
            retry: self.retry_policy(),
            local_delete: self.local_delete,
            ignore: self.ignore.clone(),
        }
    }
}

fn resolve_local_root(path: &Path) -> Result<PathBuf, ConfigError> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::LocalRootMissing(path.to_path_buf()));
        }
        Err(source) => {
            return Err(ConfigError::LocalRoot {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if !meta.is_dir() {
        return Err(ConfigError::NotADirectory(path.to_path_buf()));
    }
    path.canonicalize().map_err(|source| ConfigError::LocalRoot {
        path: path.to_path_buf(),
        source,
    })
}

/// One path segment naming this machine: the explicit name, else the
/// system host name.
fn host_segment(explicit: Option<&str>) -> Result<String, ConfigError> {
    let name = match explicit {
        Some(name) => name.to_string(),
        None => system_host_name().unwrap_or_default(),
    };
    let segment = name.trim().replace('/', "-");
    if segment.is_empty() {
        return Err(ConfigError::NoHostName);
    }
    Ok(segment)
}

fn system_host_name() -> Option<String> {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
}

fn normalize_remote_path(raw: &str) -> String {
    let parts: Vec<&str> = raw
        .split('/')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    format!("/{}", parts.join("/"))
}
