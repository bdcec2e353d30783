//! Phase runners: shared plumbing and the per-phase coordination logic.
//!
//! Each runner follows the same contract: load the item, check the state
//! guard, drive the agent (with retries where the phase allows them),
//! validate artifacts and scope, then either advance the persisted state or
//! record the failure on the item. A runner always returns a `PhaseResult`
//! whose `item` field is the authoritative post-run state, even on failure.

pub mod complete;
pub mod critique;
pub mod implement;
pub mod plan;
pub mod pr;
pub mod research;

use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::agent::AgentRunner;
use crate::config::Config;
use crate::errors::WorkflowError;
use crate::events::EventSender;
use crate::git::Git;
use crate::item::Item;
use crate::prompts::PromptStore;
use crate::repo::Repository;
use crate::scope::ScopeEnforcer;

/// Validation-retry budget for the research and plan phases.
pub const MAX_VALIDATION_ATTEMPTS: u32 = 3;

/// Tool allow-lists per phase. The implement phase gets the full set; the
/// complete phase runs no agent at all.
pub const RESEARCH_TOOLS: &[&str] = &["Read", "Glob", "Grep", "WebSearch", "WebFetch"];
pub const PLAN_TOOLS: &[&str] = &["Read", "Glob", "Grep", "WebSearch", "WebFetch", "Write", "Edit"];
pub const IMPLEMENT_TOOLS: &[&str] = &["Read", "Write", "Edit", "Glob", "Grep", "Bash"];
pub const CRITIQUE_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Bash"];
pub const PR_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Bash"];

/// Outcome of one runner invocation.
#[derive(Debug)]
pub struct PhaseResult {
    pub success: bool,
    /// Authoritative post-run item state
    pub item: Item,
    pub error: Option<WorkflowError>,
}

impl PhaseResult {
    pub fn ok(item: Item) -> Self {
        Self {
            success: true,
            item,
            error: None,
        }
    }

    pub fn failed(item: Item, error: WorkflowError) -> Self {
        Self {
            success: false,
            item,
            error: Some(error),
        }
    }
}

/// Everything a runner needs: configuration, stores, git, and the agent seam.
pub struct RunnerContext {
    pub config: Config,
    pub repo: Repository,
    pub prompts: PromptStore,
    pub git: Git,
    pub agent: Arc<dyn AgentRunner>,
    pub events: Option<EventSender>,
}

impl RunnerContext {
    pub fn new(config: Config, agent: Arc<dyn AgentRunner>, events: Option<EventSender>) -> Self {
        let repo = Repository::new(config.items_dir.clone());
        let prompts = PromptStore::new(config.prompts_dir.clone());
        let git = Git::new(config.project_dir.clone());
        Self {
            config,
            repo,
            prompts,
            git,
            agent,
            events,
        }
    }

    pub fn scope(&self) -> ScopeEnforcer {
        ScopeEnforcer::new(&self.config.project_dir)
    }

    /// Record a phase failure on the item and persist it. Persistence
    /// problems are logged, not raised, so the original error survives.
    pub fn fail_phase(&self, mut item: Item, error: WorkflowError) -> PhaseResult {
        item.last_error = Some(error.to_string());
        if let Err(e) = self.repo.save_item(&mut item) {
            tracing::error!(item = %item.id, error = %e, "failed to persist last_error");
        }
        PhaseResult::failed(item, error)
    }

    /// Short run identifier for progress-log phase entries.
    pub fn new_run_id(&self) -> String {
        Uuid::new_v4().to_string()[..8].to_string()
    }
}

/// Repo-relative path of an item artifact, for scope allow-lists and
/// prompt variables.
pub fn rel_item_path(item_id: &str, file: &str) -> PathBuf {
    PathBuf::from(".wreckit").join("items").join(item_id).join(file)
}

/// Repo-relative item directory.
pub fn rel_item_dir(item_id: &str) -> PathBuf {
    PathBuf::from(".wreckit").join("items").join(item_id)
}
