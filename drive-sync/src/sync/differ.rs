use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::local::LocalSnapshot;
use super::record::{Side, SkippedPath};
use super::remote_scan::RemoteSnapshot;
use super::state::SyncState;

/// Three-way change category of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClassification {
    Unchanged,
    LocalAdded,
    LocalModified,
    LocalDeleted,
    RemoteAdded,
    RemoteModified,
    RemoteDeleted,
    BothModified,
    BothDeleted,
    AddAddConflict,
    /// Deleted on one side, edited on the other; `edited` names the survivor.
    EditDeleteConflict { edited: Side },
}

impl ChangeClassification {
    pub fn is_conflict(self) -> bool {
        matches!(
            self,
            ChangeClassification::BothModified
                | ChangeClassification::AddAddConflict
                | ChangeClassification::EditDeleteConflict { .. }
        )
    }
}

impl fmt::Display for ChangeClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeClassification::Unchanged => "unchanged",
            ChangeClassification::LocalAdded => "local-added",
            ChangeClassification::LocalModified => "local-modified",
            ChangeClassification::LocalDeleted => "local-deleted",
            ChangeClassification::RemoteAdded => "remote-added",
            ChangeClassification::RemoteModified => "remote-modified",
            ChangeClassification::RemoteDeleted => "remote-deleted",
            ChangeClassification::BothModified => "both-modified",
            ChangeClassification::BothDeleted => "both-deleted",
            ChangeClassification::AddAddConflict => "add-add-conflict",
            ChangeClassification::EditDeleteConflict { edited: Side::Local } => {
                "remote-deleted-local-edited"
            }
            ChangeClassification::EditDeleteConflict {
                edited: Side::Remote,
            } => "local-deleted-remote-edited",
        };
        f.write_str(label)
    }
}

/// Classifies every path in the union of the three snapshots. Fingerprints
/// alone decide "changed"; timestamps are never consulted. Paths that either
/// scanner could not observe are left out.
pub fn classify(
    baseline: &SyncState,
    local: &LocalSnapshot,
    remote: &RemoteSnapshot,
) -> BTreeMap<String, ChangeClassification> {
    let paths: BTreeSet<&String> = baseline
        .paths()
        .chain(local.files.keys())
        .chain(remote.files.keys())
        .collect();

    let mut out = BTreeMap::new();
    for path in paths {
        if local.is_skipped(path) || remote.is_skipped(path) {
            continue;
        }
        if collides_with_remote_folder(path, local, remote) {
            continue;
        }

        let base = baseline.get(path);
        let local_fp = local.files.get(path).map(|r| r.fingerprint.as_str());
        let remote_fp = remote.files.get(path).map(|r| r.fingerprint.as_str());

        let classification = match (base, local_fp, remote_fp) {
            (Some(base), Some(l), Some(r)) => {
                let local_changed = l != base.fingerprint;
                let remote_changed = r != base.remote_fingerprint;
                match (local_changed, remote_changed) {
                    (false, false) => ChangeClassification::Unchanged,
                    (true, false) => ChangeClassification::LocalModified,
                    (false, true) => ChangeClassification::RemoteModified,
                    (true, true) if l == r => ChangeClassification::Unchanged,
                    (true, true) => ChangeClassification::BothModified,
                }
            }
            (Some(base), Some(l), None) => {
                if l == base.fingerprint {
                    ChangeClassification::RemoteDeleted
                } else {
                    ChangeClassification::EditDeleteConflict { edited: Side::Local }
                }
            }
            (Some(base), None, Some(r)) => {
                if r == base.remote_fingerprint {
                    ChangeClassification::LocalDeleted
                } else {
                    ChangeClassification::EditDeleteConflict {
                        edited: Side::Remote,
                    }
                }
            }
            (Some(_), None, None) => ChangeClassification::BothDeleted,
            (None, Some(_), None) => ChangeClassification::LocalAdded,
            (None, None, Some(_)) => ChangeClassification::RemoteAdded,
            (None, Some(l), Some(r)) if l == r => ChangeClassification::Unchanged,
            (None, Some(_), Some(_)) => ChangeClassification::AddAddConflict,
            (None, None, None) => continue,
        };
        out.insert(path.clone(), classification);
    }
    out
}

/// Local files whose path is a folder on the remote side. They are never
/// classified and are reported instead.
pub fn folder_collisions(local: &LocalSnapshot, remote: &RemoteSnapshot) -> Vec<SkippedPath> {
    local
        .files
        .keys()
        .filter(|path| collides_with_remote_folder(path, local, remote))
        .map(|path| {
            tracing::warn!(path = %path, "local file collides with a remote folder; skipping");
            SkippedPath {
                side: Side::Local,
                path: path.clone(),
                reason: "a remote folder has the same path".into(),
            }
        })
        .collect()
}

fn collides_with_remote_folder(path: &str, local: &LocalSnapshot, remote: &RemoteSnapshot) -> bool {
    local.files.contains_key(path) && remote.folders.contains_key(path)
}
