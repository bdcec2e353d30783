//! Critique phase: an adversarial review of the finished implementation.
//!
//! The critic's verdict arrives as JSON in the agent's output. Rejection
//! regresses the item to `planned` so the implement phase runs again; a
//! technical failure (timeout, non-zero exit, unparseable output) is treated
//! the same way: an implementation too complex to critique counts as a
//! rejection, not a hard failure. Both regressions return
//! `success = true` so the orchestrator loop keeps going.

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};

use super::{CRITIQUE_TOOLS, PhaseResult, RunnerContext};
use crate::agent::AgentInvocation;
use crate::errors::WorkflowError;
use crate::events::{WorkflowEvent, emit};
use crate::item::ItemState;
use crate::orchestrator::Phase;
use crate::state::verify_transition;
use crate::util::extract_last_json;

#[derive(Debug, Deserialize)]
struct CritiqueVerdict {
    status: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    critique: String,
}

/// Regress the item to `planned` and report the run as successful so the
/// implement phase gets another go.
fn regress(
    ctx: &RunnerContext,
    mut item: crate::item::Item,
    last_error: String,
    progress_entry: String,
) -> Result<PhaseResult> {
    warn!(item = %item.id, "{}", last_error);
    item.state = ItemState::Planned;
    item.last_error = Some(last_error);
    ctx.repo.save_item(&mut item)?;
    ctx.repo.append_progress(&item.id, &progress_entry)?;
    emit(
        &ctx.events,
        WorkflowEvent::PhaseChanged {
            item_id: item.id.clone(),
            state: item.state,
        },
    );
    Ok(PhaseResult::ok(item))
}

pub async fn run(ctx: &RunnerContext, item_id: &str, force: bool) -> Result<PhaseResult> {
    let mut item = ctx.repo.load_item(item_id)?;
    let run_id = ctx.new_run_id();

    if !matches!(item.state, ItemState::Implementing | ItemState::Critique) && !force {
        let err = WorkflowError::WrongState {
            id: item.id.clone(),
            expected: ItemState::Implementing,
            actual: item.state,
        };
        return Ok(ctx.fail_phase(item, err));
    }

    if item.state == ItemState::Critique && !force {
        info!(item = item_id, "already critiqued, short-circuiting");
        return Ok(PhaseResult::ok(item));
    }

    if !ctx.repo.has_prd(item_id) {
        let err = WorkflowError::MissingArtifact("prd.json".to_string());
        return Ok(ctx.fail_phase(item, err));
    }
    let prd = match ctx.repo.load_prd(item_id) {
        Ok(prd) => prd,
        Err(err) => return Ok(ctx.fail_phase(item, err)),
    };
    let plan = ctx.repo.read_plan(item_id).unwrap_or_default();

    let mut vars: HashMap<&str, String> = HashMap::new();
    vars.insert("item_id", item.id.clone());
    vars.insert("title", item.title.clone());
    vars.insert("plan", plan);
    vars.insert("prd", serde_json::to_string_pretty(&prd)?);
    let prompt = ctx.prompts.render("critique", &vars)?;

    let timeout = ctx.config.timeout_for(Phase::Critique);
    info!(item = item_id, timeout_secs = timeout, "running critique agent");
    let outcome = ctx
        .agent
        .run(
            AgentInvocation {
                prompt,
                cwd: ctx.config.project_dir.clone(),
                allowed_tools: CRITIQUE_TOOLS.iter().map(|s| s.to_string()).collect(),
                tool_server_url: None,
                timeout_secs: timeout,
            },
            ctx.events.clone(),
        )
        .await?;

    // Self-healing: a critic that cannot run is a critic that rejects
    if let Some(err) = outcome.failure_error(timeout) {
        let message = format!("Critique Failed: critic error: {}", err);
        return regress(
            ctx,
            item,
            message.clone(),
            format!("CRITIQUE({}) ERROR: {}", run_id, err),
        );
    }

    let verdict = extract_last_json::<CritiqueVerdict>(&outcome.output)
        .filter(|v| matches!(v.status.as_str(), "approved" | "rejected"));
    let Some(verdict) = verdict else {
        let err = WorkflowError::AgentOutput {
            expected: "critique verdict".to_string(),
            message: "no parseable verdict in critic output".to_string(),
        };
        return regress(
            ctx,
            item,
            format!("Critique Failed: {}", err),
            format!("CRITIQUE({}) ERROR: unparseable verdict", run_id),
        );
    };

    if verdict.status == "approved" {
        if item.state == ItemState::Implementing {
            let vctx = ctx.repo.validation_context(&item);
            if let Err(err) = verify_transition(&item, ItemState::Critique, &vctx, force) {
                return Ok(ctx.fail_phase(item, err));
            }
            item.state = ItemState::Critique;
        }
        item.last_error = None;
        ctx.repo.save_item(&mut item)?;
        ctx.repo.append_progress(
            item_id,
            &format!("CRITIQUE({}) APPROVED: {}", run_id, verdict.reason),
        )?;
        if !verdict.critique.is_empty() {
            ctx.repo
                .append_progress(item_id, &format!("CRITIQUE NOTES: {}", verdict.critique))?;
        }
        emit(
            &ctx.events,
            WorkflowEvent::PhaseChanged {
                item_id: item.id.clone(),
                state: item.state,
            },
        );
        Ok(PhaseResult::ok(item))
    } else {
        let message = format!("Critique Failed: {}", verdict.reason);
        regress(
            ctx,
            item,
            message,
            format!("CRITIQUE({}) REJECTED: {}", run_id, verdict.reason),
        )
    }
}
