//! State model: legal workflow transitions and the validation context.
//!
//! Transition legality is decided in two layers. The *ordering* check
//! verifies that (from, to) is one of the allowed edges; the *artifact*
//! check verifies that the on-disk evidence for the target state exists.
//! `force` bypasses only the ordering check. Quality validators run in the
//! phase runners before the transition is attempted; this module only looks
//! at artifact presence and PRD story status.

use crate::errors::WorkflowError;
use crate::item::{Item, ItemState, Prd};

/// Read-only snapshot of an item's on-disk evidence, built fresh before
/// every transition decision and never stored.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub has_research_md: bool,
    pub has_plan_md: bool,
    pub prd: Option<Prd>,
    pub has_pr: bool,
    pub pr_merged: bool,
}

impl ValidationContext {
    fn prd_all_done(&self) -> bool {
        self.prd.as_ref().is_some_and(|p| p.all_stories_done())
    }
}

/// The allowed (from, to) edges of the workflow.
fn is_allowed_edge(from: ItemState, to: ItemState) -> bool {
    use ItemState::*;
    matches!(
        (from, to),
        (Idea, Researched)
            | (Researched, Planned)
            | (Planned, Implementing)
            | (Implementing, Critique)
            | (Critique, InPr)
            | (Critique, Planned)
            | (InPr, Done)
            // Direct-merge shortcut
            | (Planned, Done)
            | (Implementing, Done)
            | (Critique, Done)
    )
}

/// Verify that `item` may move to `to` given the on-disk evidence.
///
/// `force` bypasses the ordering check but never the artifact predicates.
pub fn verify_transition(
    item: &Item,
    to: ItemState,
    ctx: &ValidationContext,
    force: bool,
) -> Result<(), WorkflowError> {
    let from = item.state;

    if !force && !is_allowed_edge(from, to) {
        return Err(WorkflowError::ForbiddenTransition {
            from,
            to,
            reason: "not a legal workflow edge".to_string(),
        });
    }

    let missing = |what: &str| {
        Err(WorkflowError::ForbiddenTransition {
            from,
            to,
            reason: format!("missing prerequisite: {}", what),
        })
    };

    match to {
        ItemState::Idea => Ok(()),
        ItemState::Researched => {
            if !ctx.has_research_md {
                return missing("research.md");
            }
            Ok(())
        }
        ItemState::Planned => {
            if !ctx.has_plan_md {
                return missing("plan.md");
            }
            if ctx.prd.is_none() {
                return missing("prd.json");
            }
            Ok(())
        }
        ItemState::Implementing => {
            if ctx.prd.is_none() {
                return missing("prd.json");
            }
            Ok(())
        }
        ItemState::Critique => {
            if ctx.prd.is_none() {
                return missing("prd.json");
            }
            if !ctx.prd_all_done() {
                return missing("all user stories done");
            }
            Ok(())
        }
        ItemState::InPr => {
            if !ctx.has_pr {
                return missing("pull request");
            }
            Ok(())
        }
        ItemState::Done => {
            let pr_complete = ctx.has_pr && ctx.pr_merged;
            let direct_complete = item.rollback_sha.is_some();
            if !pr_complete && !direct_complete {
                return missing("merged PR or direct-merge rollback SHA");
            }
            Ok(())
        }
    }
}
