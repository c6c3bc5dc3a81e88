use std::path::{Component, Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use thiserror::Error;

/// Patterns every pass ignores on both sides.
pub const DEFAULT_IGNORES: &[&str] = &[".*", "*~", "*.tmp", "*.partial", "~$*"];

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8(PathBuf),
    #[error("invalid ignore pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: ignore::Error,
    },
}

/// Maps a normalized relative path ("Docs/A.txt") under `root`.
pub fn local_path_for(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(relative.to_string()));
            }
        }
    }
    Ok(out)
}

/// Normalized relative path of `path` below `root`, '/'-separated.
pub fn relative_path(root: &Path, path: &Path) -> Result<String, PathError> {
    let stripped = path.strip_prefix(root).unwrap_or(path);
    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| PathError::NonUtf8(path.to_path_buf()))?,
            ),
            Component::CurDir => continue,
            _ => {
                return Err(PathError::UnsupportedComponent(
                    stripped.display().to_string(),
                ));
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

pub fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Splits "Docs/A.txt" into ("Docs", "A.txt"); top-level files have an empty parent.
pub fn split_parent(relative: &str) -> (&str, &str) {
    match relative.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", relative),
    }
}

/// True when `path` equals `prefix` or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Gitignore-style exclusion rules shared by the local and remote scanners.
#[derive(Clone)]
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl IgnoreRules {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PathError> {
        let mut builder = GitignoreBuilder::new("");
        for pattern in patterns {
            let pattern = pattern.as_ref();
            builder
                .add_line(None, pattern)
                .map_err(|source| PathError::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
        }
        let matcher = builder.build().map_err(|source| PathError::Pattern {
            pattern: "<set>".to_string(),
            source,
        })?;
        Ok(Self { matcher })
    }

    pub fn with_defaults<S: AsRef<str>>(extra: &[S]) -> Result<Self, PathError> {
        let mut patterns: Vec<&str> = DEFAULT_IGNORES.to_vec();
        patterns.extend(extra.iter().map(AsRef::as_ref));
        Self::new(&patterns)
    }

    pub fn none() -> Self {
        Self {
            matcher: Gitignore::empty(),
        }
    }

    pub fn is_ignored(&self, relative: &str, is_dir: bool) -> bool {
        self.matcher
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }
}

impl std::fmt::Debug for IgnoreRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IgnoreRules")
            .field("patterns", &self.matcher.num_ignores())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_relative_path_under_root() {
        let root = PathBuf::from("/sync");
        let mapped = local_path_for(&root, "Docs/A.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/sync/Docs/A.txt"));
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/sync");
        assert!(matches!(
            local_path_for(&root, "../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(matches!(local_path_for(&root, ""), Err(PathError::Empty)));
    }

    #[test]
    fn relative_path_uses_forward_slashes() {
        let root = PathBuf::from("/sync");
        let rel = relative_path(&root, &root.join("Docs").join("A.txt")).unwrap();
        assert_eq!(rel, "Docs/A.txt");
    }

    #[test]
    fn split_and_join_round_trip() {
        assert_eq!(split_parent("Docs/Sub/A.txt"), ("Docs/Sub", "A.txt"));
        assert_eq!(split_parent("A.txt"), ("", "A.txt"));
        assert_eq!(join_relative("", "A.txt"), "A.txt");
        assert_eq!(join_relative("Docs", "A.txt"), "Docs/A.txt");
    }

    #[test]
    fn within_matches_prefix_on_component_boundary() {
        assert!(is_within("Docs/A.txt", "Docs"));
        assert!(is_within("Docs", "Docs"));
        assert!(!is_within("Docs2/A.txt", "Docs"));
    }

    #[test]
    fn default_rules_ignore_hidden_and_temp_files() {
        let rules = IgnoreRules::with_defaults(&["build/"]).unwrap();
        assert!(rules.is_ignored(".DS_Store", false));
        assert!(rules.is_ignored("Docs/report.tmp", false));
        assert!(rules.is_ignored("Docs/~$report.docx", false));
        assert!(rules.is_ignored("build", true));
        assert!(rules.is_ignored("build/out.bin", false));
        assert!(!rules.is_ignored("Docs/report.docx", false));
    }
}
