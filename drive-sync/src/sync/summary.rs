use std::fmt;

use super::executor::ActionOutcome;
use super::record::SkippedPath;

/// Per-category results of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub uploaded: Vec<String>,
    pub downloaded: Vec<String>,
    pub deleted_local: Vec<String>,
    pub deleted_remote: Vec<String>,
    /// `(path, local copy, remote copy)`.
    pub kept_both: Vec<(String, String, String)>,
    pub manual: Vec<String>,
    /// `(path, error)`.
    pub failed: Vec<(String, String)>,
    /// Paths a scanner could not observe.
    pub skipped: Vec<SkippedPath>,
    /// Changes left alone because the pass runs in one direction only.
    pub held_back: Vec<String>,
    /// Actions never dispatched because the pass was interrupted.
    pub not_dispatched: Vec<String>,
    pub unchanged: usize,
    pub baseline_updates: usize,
}

impl PassSummary {
    pub fn record(&mut self, outcome: ActionOutcome) {
        match outcome {
            ActionOutcome::Uploaded(path) => self.uploaded.push(path),
            ActionOutcome::Downloaded(path) => self.downloaded.push(path),
            ActionOutcome::DeletedLocal(path) => self.deleted_local.push(path),
            ActionOutcome::DeletedRemote(path) => self.deleted_remote.push(path),
            ActionOutcome::KeptBoth {
                path,
                local_copy,
                remote_copy,
            } => self.kept_both.push((path, local_copy, remote_copy)),
            ActionOutcome::BaselineUpdated(_) => self.baseline_updates += 1,
            ActionOutcome::Unchanged(_) => self.unchanged += 1,
            ActionOutcome::ManualRequired(path) => self.manual.push(path),
        }
    }

    pub fn record_failure(&mut self, path: impl Into<String>, error: impl fmt::Display) {
        self.failed.push((path.into(), error.to_string()));
    }

    /// Number of actions that changed a file on either side.
    pub fn changes(&self) -> usize {
        self.uploaded.len()
            + self.downloaded.len()
            + self.deleted_local.len()
            + self.deleted_remote.len()
            + self.kept_both.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.manual.is_empty() && self.not_dispatched.is_empty()
    }

    /// Keeps report output stable regardless of worker completion order.
    pub fn sort(&mut self) {
        self.uploaded.sort();
        self.downloaded.sort();
        self.deleted_local.sort();
        self.deleted_remote.sort();
        self.kept_both.sort();
        self.manual.sort();
        self.failed.sort();
        self.held_back.sort();
        self.not_dispatched.sort();
    }
}

fn section(f: &mut fmt::Formatter<'_>, title: &str, paths: &[String]) -> fmt::Result {
    writeln!(f, "{title:<16}{}", paths.len())?;
    for path in paths {
        writeln!(f, "  {path}")?;
    }
    Ok(())
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Sync Summary ===")?;
        section(f, "Uploaded:", &self.uploaded)?;
        section(f, "Downloaded:", &self.downloaded)?;
        section(f, "Deleted local:", &self.deleted_local)?;
        section(f, "Deleted remote:", &self.deleted_remote)?;

        writeln!(f, "{:<16}{}", "Kept both:", self.kept_both.len())?;
        for (path, local_copy, remote_copy) in &self.kept_both {
            writeln!(f, "  {path} (local: {local_copy}, remote: {remote_copy})")?;
        }
        section(f, "Manual:", &self.manual)?;

        writeln!(f, "{:<16}{}", "Failed:", self.failed.len())?;
        for (path, error) in &self.failed {
            writeln!(f, "  {path}: {error}")?;
        }
        if !self.skipped.is_empty() {
            writeln!(f, "{:<16}{}", "Unreadable:", self.skipped.len())?;
            for skipped in &self.skipped {
                writeln!(f, "  [{}] {}: {}", skipped.side, skipped.path, skipped.reason)?;
            }
        }
        if !self.held_back.is_empty() {
            section(f, "Held back:", &self.held_back)?;
        }
        if !self.not_dispatched.is_empty() {
            section(f, "Not started:", &self.not_dispatched)?;
        }
        writeln!(f, "{:<16}{}", "Unchanged:", self.unchanged)
    }
}
