//! Scope enforcement: working-tree snapshots and per-phase allow-lists.
//!
//! Before an agent runs, the enforcer captures the set of paths changed
//! relative to HEAD; afterwards it captures again and diffs. Everything the
//! agent newly touched must fall under the phase's allow-list of path
//! prefixes, or the phase fails with a `ScopeViolation`. The implement phase
//! has no strict allow-list but flags writes into the engine's metadata
//! directory that land outside the item's own directory.

use anyhow::{Context, Result};
use git2::{Repository as GitRepository, Status, StatusOptions};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::errors::WorkflowError;

/// One changed path with its porcelain-style status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub status: String,
    pub path: PathBuf,
}

/// Working-tree changes relative to HEAD at one point in time.
#[derive(Debug, Clone, Default)]
pub struct FilesystemSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl FilesystemSnapshot {
    fn paths(&self) -> BTreeSet<&Path> {
        self.entries.iter().map(|e| e.path.as_path()).collect()
    }
}

fn status_code(status: Status) -> &'static str {
    if status.contains(Status::WT_NEW) || status.contains(Status::INDEX_NEW) {
        "A"
    } else if status.contains(Status::WT_DELETED) || status.contains(Status::INDEX_DELETED) {
        "D"
    } else if status.contains(Status::WT_RENAMED) || status.contains(Status::INDEX_RENAMED) {
        "R"
    } else {
        "M"
    }
}

/// Captures and compares working-tree snapshots for one project.
pub struct ScopeEnforcer {
    project_dir: PathBuf,
}

impl ScopeEnforcer {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
        }
    }

    /// Snapshot all paths changed relative to HEAD, untracked included.
    pub fn capture(&self) -> Result<FilesystemSnapshot> {
        let repo = GitRepository::open(&self.project_dir)
            .context("Failed to open git repository for scope snapshot")?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo
            .statuses(Some(&mut opts))
            .context("Failed to read git status")?;

        let mut entries = Vec::new();
        for entry in statuses.iter() {
            if let Some(path) = entry.path() {
                entries.push(SnapshotEntry {
                    status: status_code(entry.status()).to_string(),
                    path: PathBuf::from(path),
                });
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(FilesystemSnapshot { entries })
    }
}

/// Paths present in `after` but not in `before` (set difference by path).
pub fn snapshot_delta(before: &FilesystemSnapshot, after: &FilesystemSnapshot) -> Vec<PathBuf> {
    let before_paths = before.paths();
    after
        .entries
        .iter()
        .filter(|e| !before_paths.contains(e.path.as_path()))
        .map(|e| e.path.clone())
        .collect()
}

fn is_under(path: &Path, prefix: &Path) -> bool {
    path == prefix || path.starts_with(prefix)
}

/// Enforce a strict allow-list: every delta path must sit under one of the
/// allowed prefixes.
pub fn enforce_allow_list(
    phase: &str,
    delta: &[PathBuf],
    allowed: &[PathBuf],
) -> Result<(), WorkflowError> {
    let violations: Vec<PathBuf> = delta
        .iter()
        .filter(|p| !allowed.iter().any(|a| is_under(p, a)))
        .cloned()
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::ScopeViolation {
            phase: phase.to_string(),
            paths: violations,
        })
    }
}

/// Non-fatal scope-creep check for the implement phase: delta paths inside
/// the engine metadata directory that do not belong to the item's own
/// directory.
pub fn metadata_scope_creep(
    delta: &[PathBuf],
    metadata_dir: &Path,
    item_dir: &Path,
) -> Vec<PathBuf> {
    delta
        .iter()
        .filter(|p| is_under(p, metadata_dir) && !is_under(p, item_dir))
        .cloned()
        .collect()
}
