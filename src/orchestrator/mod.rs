//! Orchestrator: maps item state to the next phase and drives runners in
//! sequence until the item is terminal, a phase fails, or the phase cap is
//! reached.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::item::{Item, ItemState};
use crate::phases::{self, PhaseResult, RunnerContext};

/// One step of the fixed workflow pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Plan,
    Implement,
    Critique,
    Pr,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Plan => "plan",
            Phase::Implement => "implement",
            Phase::Critique => "critique",
            Phase::Pr => "pr",
            Phase::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "research" => Ok(Phase::Research),
            "plan" => Ok(Phase::Plan),
            "implement" => Ok(Phase::Implement),
            "critique" => Ok(Phase::Critique),
            "pr" => Ok(Phase::Pr),
            "complete" => Ok(Phase::Complete),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: research, plan, implement, critique, pr, complete",
                s
            ),
        }
    }
}

/// The phase that should run next for an item in `state`, or `None` when
/// the item is terminal.
pub fn next_phase(state: ItemState) -> Option<Phase> {
    match state {
        ItemState::Idea => Some(Phase::Research),
        ItemState::Researched => Some(Phase::Plan),
        ItemState::Planned => Some(Phase::Implement),
        ItemState::Implementing => Some(Phase::Critique),
        ItemState::Critique => Some(Phase::Pr),
        ItemState::InPr => Some(Phase::Complete),
        ItemState::Done => None,
    }
}

/// Run one phase against an item.
pub async fn run_phase(
    ctx: &RunnerContext,
    phase: Phase,
    item_id: &str,
    force: bool,
) -> Result<PhaseResult> {
    info!(item = item_id, phase = %phase, "running phase");
    match phase {
        Phase::Research => phases::research::run(ctx, item_id, force).await,
        Phase::Plan => phases::plan::run(ctx, item_id, force).await,
        Phase::Implement => phases::implement::run(ctx, item_id, force).await,
        Phase::Critique => phases::critique::run(ctx, item_id, force).await,
        Phase::Pr => phases::pr::run(ctx, item_id, force).await,
        Phase::Complete => phases::complete::run(ctx, item_id, force).await,
    }
}

/// Result of driving an item through consecutive phases.
#[derive(Debug)]
pub struct RunSummary {
    /// Phases run, in order, with their success flag
    pub phases_run: Vec<(Phase, bool)>,
    /// Final item state after the last phase
    pub item: Item,
    /// Whether the run stopped on a phase failure
    pub failed: bool,
}

/// Drive an item phase by phase until it is terminal, a phase fails, or
/// `max_phases` runner invocations have happened.
pub async fn run_item(
    ctx: &RunnerContext,
    item_id: &str,
    force: bool,
    max_phases: u32,
) -> Result<RunSummary> {
    let mut phases_run = Vec::new();
    let mut item = ctx.repo.load_item(item_id)?;
    // Force applies to the first phase only; later phases run from states
    // the engine itself produced.
    let mut force = force;

    while (phases_run.len() as u32) < max_phases {
        let Some(phase) = next_phase(item.state) else {
            break;
        };
        let result = run_phase(ctx, phase, item_id, force).await?;
        force = false;
        phases_run.push((phase, result.success));
        item = result.item;
        if !result.success {
            return Ok(RunSummary {
                phases_run,
                item,
                failed: true,
            });
        }
    }

    Ok(RunSummary {
        phases_run,
        item,
        failed: false,
    })
}
