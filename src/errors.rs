//! Typed error hierarchy for the wreckit workflow engine.
//!
//! `WorkflowError` covers every failure class a phase runner can surface:
//! preconditions, artifact validation, agent failures, git preflight, quality
//! gates, and merge safety. Runners record the rendered message on
//! `Item.last_error` and return it inside a `PhaseResult`.

use std::path::PathBuf;
use thiserror::Error;

use crate::item::ItemState;

/// Errors surfaced by phase runners and the git integration layer.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Item {id} is in state '{actual}', expected '{expected}'")]
    WrongState {
        id: String,
        expected: ItemState,
        actual: ItemState,
    },

    #[error("Transition from '{from}' to '{to}' is not allowed: {reason}")]
    ForbiddenTransition {
        from: ItemState,
        to: ItemState,
        reason: String,
    },

    #[error("Prerequisite artifact missing: {0}")]
    MissingArtifact(String),

    #[error("Validation failed after {attempts} attempt(s): {message}")]
    ValidationFailed { attempts: u32, message: String },

    #[error("Scope violation: phase '{phase}' modified disallowed paths: {}", join_paths(.paths))]
    ScopeViolation { phase: String, paths: Vec<PathBuf> },

    #[error("Agent exited with non-zero code {exit_code}")]
    AgentFailure { exit_code: i32 },

    #[error("Agent timed out after {timeout_secs}s")]
    AgentTimeout { timeout_secs: u64 },

    #[error("Agent produced no usable {expected} output: {message}")]
    AgentOutput { expected: String, message: String },

    #[error("Git preflight failed: {}", .errors.join("; "))]
    GitPreflight { errors: Vec<String> },

    #[error("Quality gate(s) failed: {}", .failed.join(", "))]
    QualityGate { failed: Vec<String> },

    #[error("Remote '{remote}' URL '{actual}' does not match any allowed pattern")]
    RemoteValidation { remote: String, actual: String },

    #[error("Merge conflicts detected between '{base}' and '{head}'")]
    MergeConflict { base: String, head: String },

    #[error(
        "Direct merge requested without opt-in; set pr_checks.allow_unsafe_direct_merge to true"
    )]
    DirectMergeUnsafe,

    #[error("PR tool error: {0}")]
    PrToolError(String),

    #[error("Invalid item record: {0}")]
    InvalidItem(String),

    #[error("Invalid PRD: {0}")]
    InvalidPrd(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl WorkflowError {
    /// Whether the research/plan retry loop may recover from this error by
    /// re-running the agent with feedback. System failures never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::ValidationFailed { .. } | WorkflowError::MissingArtifact(_)
        )
    }
}
