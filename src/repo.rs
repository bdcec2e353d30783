//! Item repository and artifact store.
//!
//! Persists each item and its artifacts to a per-item directory under
//! `.wreckit/items/<id>/`:
//!
//! | File           | Contents                          |
//! |----------------|-----------------------------------|
//! | `item.json`    | the `Item` record                 |
//! | `prd.json`     | the PRD (after the plan phase)    |
//! | `research.md`  | research-phase artifact           |
//! | `plan.md`      | plan-phase artifact               |
//! | `progress.log` | append-only, ISO-8601 prefixed    |
//!
//! `item.json` and `prd.json` are schema-validated on both load and save.
//! PRD writes are atomic (temp file + rename). `save_item` stamps
//! `updated_at` and keeps it monotonic.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::WorkflowError;
use crate::item::{Item, Prd};
use crate::state::ValidationContext;

pub const ITEM_FILE: &str = "item.json";
pub const PRD_FILE: &str = "prd.json";
pub const RESEARCH_FILE: &str = "research.md";
pub const PLAN_FILE: &str = "plan.md";
pub const PROGRESS_FILE: &str = "progress.log";

/// Filesystem-backed store for items and their artifacts.
#[derive(Debug, Clone)]
pub struct Repository {
    items_dir: PathBuf,
}

impl Repository {
    pub fn new(items_dir: PathBuf) -> Self {
        Self { items_dir }
    }

    pub fn item_dir(&self, item_id: &str) -> PathBuf {
        self.items_dir.join(item_id)
    }

    pub fn item_path(&self, item_id: &str) -> PathBuf {
        self.item_dir(item_id).join(ITEM_FILE)
    }

    pub fn prd_path(&self, item_id: &str) -> PathBuf {
        self.item_dir(item_id).join(PRD_FILE)
    }

    pub fn research_path(&self, item_id: &str) -> PathBuf {
        self.item_dir(item_id).join(RESEARCH_FILE)
    }

    pub fn plan_path(&self, item_id: &str) -> PathBuf {
        self.item_dir(item_id).join(PLAN_FILE)
    }

    pub fn progress_path(&self, item_id: &str) -> PathBuf {
        self.item_dir(item_id).join(PROGRESS_FILE)
    }

    pub fn item_exists(&self, item_id: &str) -> bool {
        self.item_path(item_id).exists()
    }

    // =========================================
    // Item record
    // =========================================

    pub fn load_item(&self, item_id: &str) -> Result<Item, WorkflowError> {
        let path = self.item_path(item_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read item file: {}", path.display()))?;
        let item: Item = serde_json::from_str(&content)
            .map_err(|e| WorkflowError::InvalidItem(format!("{}: {}", path.display(), e)))?;
        item.validate()?;
        if item.id != item_id {
            return Err(WorkflowError::InvalidItem(format!(
                "item file at '{}' carries id '{}'",
                path.display(),
                item.id
            )));
        }
        Ok(item)
    }

    /// Validate and persist the item, stamping `updated_at`.
    ///
    /// The stamp never moves backwards even if the wall clock does, so
    /// `updated_at` is monotonic across saves.
    pub fn save_item(&self, item: &mut Item) -> Result<(), WorkflowError> {
        item.validate()?;
        let now = Utc::now();
        item.updated_at = if now > item.updated_at {
            now
        } else {
            item.updated_at + chrono::Duration::microseconds(1)
        };

        let dir = self.item_dir(&item.id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create item directory: {}", dir.display()))?;
        let content = serde_json::to_string_pretty(item).context("Failed to serialize item")?;
        let path = self.item_path(&item.id);
        fs::write(&path, content)
            .with_context(|| format!("Failed to write item file: {}", path.display()))?;
        Ok(())
    }

    /// List every item under the items root, recursing into nested slug
    /// directories. Sorted by id.
    pub fn list_items(&self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        if self.items_dir.exists() {
            self.collect_items(&self.items_dir, &mut items)?;
        }
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    fn collect_items(&self, dir: &Path, out: &mut Vec<Item>) -> Result<()> {
        let item_file = dir.join(ITEM_FILE);
        if item_file.exists() {
            let content = fs::read_to_string(&item_file)
                .with_context(|| format!("Failed to read {}", item_file.display()))?;
            match serde_json::from_str::<Item>(&content) {
                Ok(item) => out.push(item),
                Err(e) => debug!(path = %item_file.display(), error = %e, "skipping unparseable item file"),
            }
            return Ok(());
        }
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory {}", dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                self.collect_items(&entry.path(), out)?;
            }
        }
        Ok(())
    }

    // =========================================
    // PRD
    // =========================================

    pub fn has_prd(&self, item_id: &str) -> bool {
        self.prd_path(item_id).exists()
    }

    /// Load and repair the PRD. Out-of-range priorities are clamped into
    /// `[1,4]`; the repair is logged, not an error.
    pub fn load_prd(&self, item_id: &str) -> Result<Prd, WorkflowError> {
        let path = self.prd_path(item_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read PRD file: {}", path.display()))?;
        let mut prd: Prd = serde_json::from_str(&content)
            .map_err(|e| WorkflowError::InvalidPrd(format!("{}: {}", path.display(), e)))?;
        prd.validate()?;
        let repaired = prd.repair();
        if !repaired.is_empty() {
            debug!(item = item_id, stories = ?repaired, "clamped out-of-range story priorities on load");
        }
        Ok(prd)
    }

    /// Validate and write the PRD atomically (temp file + rename).
    pub fn save_prd(&self, item_id: &str, prd: &Prd) -> Result<(), WorkflowError> {
        prd.validate()?;
        if prd.id != item_id {
            return Err(WorkflowError::InvalidPrd(format!(
                "PRD id '{}' does not match owning item '{}'",
                prd.id, item_id
            )));
        }
        let dir = self.item_dir(item_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create item directory: {}", dir.display()))?;
        let content = serde_json::to_string_pretty(prd).context("Failed to serialize PRD")?;
        let tmp = dir.join(format!("{}.tmp", PRD_FILE));
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write temp PRD file: {}", tmp.display()))?;
        let path = self.prd_path(item_id);
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move PRD into place: {}", path.display()))?;
        Ok(())
    }

    // =========================================
    // Markdown artifacts and progress log
    // =========================================

    pub fn has_research(&self, item_id: &str) -> bool {
        self.research_path(item_id).exists()
    }

    pub fn has_plan(&self, item_id: &str) -> bool {
        self.plan_path(item_id).exists()
    }

    pub fn read_research(&self, item_id: &str) -> Result<String> {
        let path = self.research_path(item_id);
        fs::read_to_string(&path)
            .with_context(|| format!("Failed to read research file: {}", path.display()))
    }

    pub fn read_plan(&self, item_id: &str) -> Result<String> {
        let path = self.plan_path(item_id);
        fs::read_to_string(&path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))
    }

    /// Append one entry to the item's progress log, prefixed with the
    /// current UTC time in ISO-8601. Multi-line entries are kept intact.
    pub fn append_progress(&self, item_id: &str, entry: &str) -> Result<()> {
        let dir = self.item_dir(item_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create item directory: {}", dir.display()))?;
        let line = format!("[{}] {}\n", Utc::now().to_rfc3339(), entry.trim_end());
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.progress_path(item_id))
            .context("Failed to open progress log")?
            .write_all(line.as_bytes())
            .context("Failed to append progress entry")?;
        Ok(())
    }

    pub fn read_progress(&self, item_id: &str) -> Result<String> {
        let path = self.progress_path(item_id);
        if !path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&path)
            .with_context(|| format!("Failed to read progress log: {}", path.display()))
    }

    /// Assemble the transition-decision snapshot for an item from its
    /// on-disk artifacts. Built fresh on every call, never cached.
    pub fn validation_context(&self, item: &Item) -> ValidationContext {
        ValidationContext {
            has_research_md: self.has_research(&item.id),
            has_plan_md: self.has_plan(&item.id),
            prd: self.load_prd(&item.id).ok(),
            has_pr: item.pr_url.is_some(),
            pr_merged: item.merged_at.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ItemState, PRD_SCHEMA_VERSION, StoryStatus, UserStory};
    use tempfile::tempdir;

    fn repo(dir: &Path) -> Repository {
        Repository::new(dir.join("items"))
    }

    fn sample_prd(id: &str) -> Prd {
        Prd {
            schema_version: PRD_SCHEMA_VERSION,
            id: id.to_string(),
            branch_name: format!("wreckit/{}", id.replace('/', "-")),
            user_stories: vec![UserStory {
                id: "US-1".to_string(),
                title: "First".to_string(),
                acceptance_criteria: vec!["done".to_string()],
                priority: 1,
                status: StoryStatus::Pending,
                notes: String::new(),
            }],
        }
    }

    #[test]
    fn test_save_and_load_item_round_trip() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let mut item = Item::new("auth/login", "Login flow").unwrap();
        repo.save_item(&mut item).unwrap();

        let loaded = repo.load_item("auth/login").unwrap();
        assert_eq!(loaded.id, "auth/login");
        assert_eq!(loaded.state, ItemState::Idea);
        assert_eq!(loaded.updated_at, item.updated_at);

        // Byte-identical re-serialization
        let on_disk = fs::read_to_string(repo.item_path("auth/login")).unwrap();
        let re_serialized = serde_json::to_string_pretty(&loaded).unwrap();
        assert_eq!(on_disk, re_serialized);
    }

    #[test]
    fn test_save_item_bumps_updated_at_monotonically() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let mut item = Item::new("demo", "Demo").unwrap();
        repo.save_item(&mut item).unwrap();
        let first = item.updated_at;
        repo.save_item(&mut item).unwrap();
        assert!(item.updated_at > first);
    }

    #[test]
    fn test_load_item_rejects_id_mismatch() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let mut item = Item::new("actual-id", "X").unwrap();
        repo.save_item(&mut item).unwrap();
        // Copy the record under a different directory
        let other_dir = repo.item_dir("other-id");
        fs::create_dir_all(&other_dir).unwrap();
        fs::copy(repo.item_path("actual-id"), other_dir.join(ITEM_FILE)).unwrap();

        let err = repo.load_item("other-id").unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidItem(_)));
    }

    #[test]
    fn test_load_item_missing_is_error() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        assert!(repo.load_item("nope").is_err());
        assert!(!repo.item_exists("nope"));
    }

    #[test]
    fn test_prd_atomic_save_and_load() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let prd = sample_prd("demo");
        repo.save_prd("demo", &prd).unwrap();
        assert!(repo.has_prd("demo"));
        // No temp file left behind
        assert!(!repo.item_dir("demo").join("prd.json.tmp").exists());

        let loaded = repo.load_prd("demo").unwrap();
        assert_eq!(loaded, prd);
    }

    #[test]
    fn test_save_prd_rejects_id_mismatch() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let prd = sample_prd("someone-else");
        let err = repo.save_prd("demo", &prd).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidPrd(_)));
    }

    #[test]
    fn test_load_prd_repairs_priorities() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let mut prd = sample_prd("demo");
        prd.user_stories[0].priority = 9;
        // Write without validation to simulate a hand-edited file
        let item_dir = repo.item_dir("demo");
        fs::create_dir_all(&item_dir).unwrap();
        fs::write(
            item_dir.join(PRD_FILE),
            serde_json::to_string_pretty(&prd).unwrap(),
        )
        .unwrap();

        let loaded = repo.load_prd("demo").unwrap();
        assert_eq!(loaded.user_stories[0].priority, 4);
    }

    #[test]
    fn test_progress_log_appends_with_timestamp_prefix() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        repo.append_progress("demo", "first entry").unwrap();
        repo.append_progress("demo", "second entry").unwrap();

        let log = repo.read_progress("demo").unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("first entry"));
        assert!(lines[1].ends_with("second entry"));
    }

    #[test]
    fn test_read_progress_missing_is_empty() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        assert_eq!(repo.read_progress("demo").unwrap(), "");
    }

    #[test]
    fn test_list_items_recurses_nested_slugs() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let mut a = Item::new("zeta", "Z").unwrap();
        let mut b = Item::new("auth/login", "L").unwrap();
        let mut c = Item::new("auth/signup", "S").unwrap();
        repo.save_item(&mut a).unwrap();
        repo.save_item(&mut b).unwrap();
        repo.save_item(&mut c).unwrap();

        let items = repo.list_items().unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["auth/login", "auth/signup", "zeta"]);
    }

    #[test]
    fn test_validation_context_reflects_artifacts() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let mut item = Item::new("demo", "Demo").unwrap();
        repo.save_item(&mut item).unwrap();

        let ctx = repo.validation_context(&item);
        assert!(!ctx.has_research_md);
        assert!(!ctx.has_plan_md);
        assert!(ctx.prd.is_none());

        fs::write(repo.research_path("demo"), "# Research").unwrap();
        fs::write(repo.plan_path("demo"), "# Plan").unwrap();
        repo.save_prd("demo", &sample_prd("demo")).unwrap();

        let ctx = repo.validation_context(&item);
        assert!(ctx.has_research_md);
        assert!(ctx.has_plan_md);
        assert!(ctx.prd.is_some());
        assert!(!ctx.has_pr);
    }
}
