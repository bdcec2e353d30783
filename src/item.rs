//! Core data model: work items, workflow states, and the PRD.
//!
//! An `Item` is the aggregate root for one unit of work; the PRD and the
//! phase artifacts (research.md, plan.md, progress.log) live under its
//! directory and are owned by it. `ItemState` is the persisted position of
//! the item in the phase pipeline.

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::errors::WorkflowError;

static STORY_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^US-\d+$").unwrap());

/// Current PRD schema version. Bump when the on-disk shape changes.
pub const PRD_SCHEMA_VERSION: u32 = 1;

/// Position of an item in the workflow pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Captured but not yet researched
    Idea,
    /// research.md exists and passed quality validation
    Researched,
    /// plan.md and prd.json exist and passed validation
    Planned,
    /// Implement loop is driving stories to done
    Implementing,
    /// All stories done, awaiting (or passed) critique
    Critique,
    /// A pull request is open for the item branch
    InPr,
    /// Merged to the base branch; terminal
    Done,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Idea => "idea",
            ItemState::Researched => "researched",
            ItemState::Planned => "planned",
            ItemState::Implementing => "implementing",
            ItemState::Critique => "critique",
            ItemState::InPr => "in_pr",
            ItemState::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Done)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idea" => Ok(ItemState::Idea),
            "researched" => Ok(ItemState::Researched),
            "planned" => Ok(ItemState::Planned),
            "implementing" => Ok(ItemState::Implementing),
            "critique" => Ok(ItemState::Critique),
            "in_pr" => Ok(ItemState::InPr),
            "done" => Ok(ItemState::Done),
            _ => anyhow::bail!(
                "Invalid item state '{}'. Valid values: idea, researched, planned, implementing, critique, in_pr, done",
                s
            ),
        }
    }
}

/// A single tracked unit of work, from idea to merged change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    /// Stable slug identifier: lowercase alphanumerics, `-`, `/`
    pub id: String,
    pub title: String,
    /// Optional grouping folder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default)]
    pub overview: String,
    pub state: ItemState,
    /// Branch name once created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    /// Most recent phase error, cleared on phase success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checks_passed: Option<bool>,
    /// Tip of the base branch captured immediately before a direct merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Create a fresh item in the `idea` state.
    pub fn new(id: &str, title: &str) -> Result<Self, WorkflowError> {
        validate_item_id(id)?;
        let now = Utc::now();
        Ok(Self {
            id: id.to_string(),
            title: title.to_string(),
            section: None,
            overview: String::new(),
            state: ItemState::Idea,
            branch: None,
            pr_url: None,
            pr_number: None,
            last_error: None,
            completed_at: None,
            merged_at: None,
            merge_commit_sha: None,
            checks_passed: None,
            rollback_sha: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Schema-level validation applied on every load and save.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        validate_item_id(&self.id)?;
        if self.title.trim().is_empty() {
            return Err(WorkflowError::InvalidItem(format!(
                "item '{}' has an empty title",
                self.id
            )));
        }
        if self.state == ItemState::Done {
            let pr_complete = self.pr_url.is_some() && self.merged_at.is_some();
            let direct_complete = self.rollback_sha.is_some();
            if !pr_complete && !direct_complete {
                return Err(WorkflowError::InvalidItem(format!(
                    "item '{}' is done but carries neither PR merge metadata nor a rollback SHA",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// The branch this item's work lands on: prefix + id with slashes flattened.
    pub fn branch_name(&self, branch_prefix: &str) -> String {
        format!("{}{}", branch_prefix, self.id.replace('/', "-"))
    }
}

/// Validate the slug format: lowercase alphanumerics, `-`, `/`.
pub fn validate_item_id(id: &str) -> Result<(), WorkflowError> {
    if id.is_empty() {
        return Err(WorkflowError::InvalidItem("item id is empty".into()));
    }
    let ok = id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '/');
    if !ok {
        return Err(WorkflowError::InvalidItem(format!(
            "item id '{}' is not a valid slug (lowercase alphanumerics, '-', '/')",
            id
        )));
    }
    if id.starts_with('/') || id.ends_with('/') || id.contains("//") || id.contains("..") {
        return Err(WorkflowError::InvalidItem(format!(
            "item id '{}' contains an invalid path segment",
            id
        )));
    }
    Ok(())
}

/// Convert a free-form title to a slug usable as an item id.
pub fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Status of a single user story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StoryStatus::Pending => "pending",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Done => "done",
            StoryStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One atomic unit of implementation inside a PRD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStory {
    /// Conventionally `US-<n>`
    pub id: String,
    pub title: String,
    /// Non-empty ordered list
    pub acceptance_criteria: Vec<String>,
    /// 1 (highest) through 4 (lowest)
    pub priority: u8,
    pub status: StoryStatus,
    #[serde(default)]
    pub notes: String,
}

/// The product requirements document authored during the plan phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prd {
    pub schema_version: u32,
    /// Must equal the owning item's id
    pub id: String,
    /// Must equal `<branch_prefix><id-with-slashes-replaced>`
    pub branch_name: String,
    pub user_stories: Vec<UserStory>,
}

impl Prd {
    /// Schema validation: id slug, story count, unique story ids, id convention.
    ///
    /// Priority range is NOT checked here; an agent-submitted PRD is rejected
    /// for out-of-range priorities by the story quality validator, while a PRD
    /// read back from disk is repaired by clamping (see [`Prd::repair`]).
    pub fn validate(&self) -> Result<(), WorkflowError> {
        validate_item_id(&self.id).map_err(|e| WorkflowError::InvalidPrd(e.to_string()))?;
        if self.user_stories.is_empty() {
            return Err(WorkflowError::InvalidPrd(format!(
                "PRD for '{}' has no user stories",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for story in &self.user_stories {
            if !STORY_ID_REGEX.is_match(&story.id) {
                return Err(WorkflowError::InvalidPrd(format!(
                    "story id '{}' does not match the US-<n> convention",
                    story.id
                )));
            }
            if !seen.insert(story.id.as_str()) {
                return Err(WorkflowError::InvalidPrd(format!(
                    "duplicate story id '{}'",
                    story.id
                )));
            }
        }
        Ok(())
    }

    /// Clamp story priorities into `[1,4]`. Returns the ids of repaired
    /// stories so callers can log the repair.
    pub fn repair(&mut self) -> Vec<String> {
        let mut repaired = Vec::new();
        for story in &mut self.user_stories {
            if story.priority < 1 || story.priority > 4 {
                story.priority = story.priority.clamp(1, 4);
                repaired.push(story.id.clone());
            }
        }
        repaired
    }

    pub fn all_stories_done(&self) -> bool {
        self.user_stories
            .iter()
            .all(|s| s.status == StoryStatus::Done)
    }

    pub fn pending_story_count(&self) -> usize {
        self.user_stories
            .iter()
            .filter(|s| s.status != StoryStatus::Done)
            .count()
    }

    /// Next story to implement: lowest priority value first, ties broken by
    /// story id lexicographic order (which matches insertion order for the
    /// `US-<n>` convention up to 9 stories, and is stable beyond).
    pub fn next_pending_story(&self) -> Option<&UserStory> {
        self.user_stories
            .iter()
            .filter(|s| matches!(s.status, StoryStatus::Pending | StoryStatus::InProgress))
            .min_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)))
    }

    pub fn story_mut(&mut self, story_id: &str) -> Option<&mut UserStory> {
        self.user_stories.iter_mut().find(|s| s.id == story_id)
    }
}
