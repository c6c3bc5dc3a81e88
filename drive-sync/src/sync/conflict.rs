use std::collections::HashSet;
use std::fmt;

use super::differ::ChangeClassification;
use super::record::{FileRecord, Side};
use super::state::BaselineEntry;

/// How a path changed on both sides is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ConflictPolicy {
    /// Later `modified_at` wins; a tie goes to the remote side.
    #[default]
    NewerWins,
    PreferLocal,
    PreferRemote,
    /// Leave both sides untouched and report the path.
    Manual,
}

/// Which side a pass is allowed to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SyncDirection {
    /// Changes flow both ways.
    #[default]
    Auto,
    /// Only the remote side is written; remote changes are held back.
    LocalToRemote,
    /// Only the local side is written; local changes are held back.
    RemoteToLocal,
}

impl SyncDirection {
    fn allows(self, action: &ResolvedAction) -> bool {
        match (self, action) {
            (SyncDirection::Auto, _) | (_, ResolvedAction::Skip(..)) => true,
            (
                SyncDirection::LocalToRemote,
                ResolvedAction::Upload(_) | ResolvedAction::DeleteRemote(_),
            ) => true,
            (
                SyncDirection::RemoteToLocal,
                ResolvedAction::Download(_) | ResolvedAction::DeleteLocal(_),
            ) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Baseline already matches both sides.
    Unchanged,
    /// Content agrees on both sides but the baseline is missing or stale.
    InSync,
    BothDeleted,
    RequiresManualResolution,
    /// The change would write to the side the pass direction leaves alone.
    /// The baseline is kept so a later two-way pass still sees it.
    OtherDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAction {
    Upload(String),
    Download(String),
    DeleteLocal(String),
    DeleteRemote(String),
    /// `new_local_path` receives the local content and `new_remote_path` the
    /// remote content; the winner keeps `path`.
    RenameAndKeepBoth {
        path: String,
        new_local_path: String,
        new_remote_path: String,
    },
    Skip(String, SkipReason),
}

impl ResolvedAction {
    pub fn path(&self) -> &str {
        match self {
            ResolvedAction::Upload(path)
            | ResolvedAction::Download(path)
            | ResolvedAction::DeleteLocal(path)
            | ResolvedAction::DeleteRemote(path)
            | ResolvedAction::RenameAndKeepBoth { path, .. }
            | ResolvedAction::Skip(path, _) => path,
        }
    }

    /// True when executing the action touches neither side nor the baseline.
    pub fn is_noop(&self) -> bool {
        matches!(self, ResolvedAction::Skip(_, SkipReason::Unchanged))
    }
}

impl fmt::Display for ResolvedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedAction::Upload(path) => write!(f, "upload {path}"),
            ResolvedAction::Download(path) => write!(f, "download {path}"),
            ResolvedAction::DeleteLocal(path) => write!(f, "delete local {path}"),
            ResolvedAction::DeleteRemote(path) => write!(f, "delete remote {path}"),
            ResolvedAction::RenameAndKeepBoth {
                path,
                new_local_path,
                new_remote_path,
            } => write!(
                f,
                "keep both {path} (local -> {new_local_path}, remote -> {new_remote_path})"
            ),
            ResolvedAction::Skip(path, reason) => write!(f, "skip {path} ({reason:?})"),
        }
    }
}

/// Turns classifications into actions. Tracks every path in use so conflict
/// copies never overwrite an existing file.
pub struct ConflictResolver {
    policy: ConflictPolicy,
    direction: SyncDirection,
    occupied: HashSet<String>,
}

impl ConflictResolver {
    pub fn new<I: IntoIterator<Item = String>>(policy: ConflictPolicy, occupied: I) -> Self {
        Self {
            policy,
            direction: SyncDirection::Auto,
            occupied: occupied.into_iter().collect(),
        }
    }

    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Resolves like a two-way pass, then holds back anything that would
    /// write to the side `direction` leaves alone.
    pub fn resolve(
        &mut self,
        path: &str,
        classification: ChangeClassification,
        local: Option<&FileRecord>,
        remote: Option<&FileRecord>,
        baseline: Option<&BaselineEntry>,
    ) -> ResolvedAction {
        let action = self.resolve_two_way(path, classification, local, remote, baseline);
        if self.direction.allows(&action) {
            action
        } else {
            ResolvedAction::Skip(path.to_string(), SkipReason::OtherDirection)
        }
    }

    fn resolve_two_way(
        &mut self,
        path: &str,
        classification: ChangeClassification,
        local: Option<&FileRecord>,
        remote: Option<&FileRecord>,
        baseline: Option<&BaselineEntry>,
    ) -> ResolvedAction {
        let path_owned = path.to_string();
        match classification {
            ChangeClassification::LocalAdded | ChangeClassification::LocalModified => {
                ResolvedAction::Upload(path_owned)
            }
            ChangeClassification::RemoteAdded | ChangeClassification::RemoteModified => {
                ResolvedAction::Download(path_owned)
            }
            ChangeClassification::LocalDeleted => ResolvedAction::DeleteRemote(path_owned),
            ChangeClassification::RemoteDeleted => ResolvedAction::DeleteLocal(path_owned),
            ChangeClassification::BothDeleted => {
                ResolvedAction::Skip(path_owned, SkipReason::BothDeleted)
            }
            ChangeClassification::Unchanged => {
                if baseline_is_current(baseline, local, remote) {
                    ResolvedAction::Skip(path_owned, SkipReason::Unchanged)
                } else {
                    ResolvedAction::Skip(path_owned, SkipReason::InSync)
                }
            }
            ChangeClassification::EditDeleteConflict { edited: Side::Local } => {
                ResolvedAction::Upload(path_owned)
            }
            ChangeClassification::EditDeleteConflict {
                edited: Side::Remote,
            } => ResolvedAction::Download(path_owned),
            ChangeClassification::BothModified | ChangeClassification::AddAddConflict
                if self.direction != SyncDirection::Auto =>
            {
                // keeping both sides would write to both
                ResolvedAction::Skip(path_owned, SkipReason::RequiresManualResolution)
            }
            ChangeClassification::BothModified | ChangeClassification::AddAddConflict => {
                let winner = match self.policy {
                    ConflictPolicy::Manual => {
                        return ResolvedAction::Skip(
                            path_owned,
                            SkipReason::RequiresManualResolution,
                        );
                    }
                    ConflictPolicy::PreferLocal => Side::Local,
                    ConflictPolicy::PreferRemote => Side::Remote,
                    ConflictPolicy::NewerWins => {
                        let local_at = local.map_or(i64::MIN, |r| r.modified_at);
                        let remote_at = remote.map_or(i64::MIN, |r| r.modified_at);
                        if local_at > remote_at {
                            Side::Local
                        } else {
                            Side::Remote
                        }
                    }
                };
                let loser = match winner {
                    Side::Local => Side::Remote,
                    Side::Remote => Side::Local,
                };
                let renamed = self.claim_conflict_path(path, loser);
                let (new_local_path, new_remote_path) = match winner {
                    Side::Local => (path_owned.clone(), renamed),
                    Side::Remote => (renamed, path_owned.clone()),
                };
                ResolvedAction::RenameAndKeepBoth {
                    path: path_owned,
                    new_local_path,
                    new_remote_path,
                }
            }
        }
    }

    fn claim_conflict_path(&mut self, path: &str, loser: Side) -> String {
        let mut n = 1;
        loop {
            let candidate = conflict_path(path, loser, n);
            if self.occupied.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

fn baseline_is_current(
    baseline: Option<&BaselineEntry>,
    local: Option<&FileRecord>,
    remote: Option<&FileRecord>,
) -> bool {
    let (Some(base), Some(local), Some(remote)) = (baseline, local, remote) else {
        return false;
    };
    base.fingerprint == local.fingerprint
        && base.remote_fingerprint == remote.fingerprint
        && base.remote_id == remote.remote_id
}

/// "Docs/c.txt" -> "Docs/c (local-conflict).txt"; later collisions get a counter.
pub fn conflict_path(path: &str, side: Side, n: u32) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };
    let tag = if n <= 1 {
        format!("{side}-conflict")
    } else {
        format!("{side}-conflict {n}")
    };

    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{dir}{stem} ({tag}).{ext}");
    }

    format!("{dir}{name} ({tag})")
}
