//! Plan phase: drive the agent to produce `plan.md` and submit a PRD via
//! the `save_prd` tool endpoint, validate both, and advance the item from
//! `researched` to `planned`.
//!
//! The PRD is buffered by the tool server and flushed to disk only when the
//! whole attempt validates; a rejected attempt leaves no partial PRD behind.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{info, warn};

use super::{MAX_VALIDATION_ATTEMPTS, PLAN_TOOLS, PhaseResult, RunnerContext, rel_item_path};
use crate::agent::AgentInvocation;
use crate::errors::WorkflowError;
use crate::events::{WorkflowEvent, emit};
use crate::item::{ItemState, Prd};
use crate::orchestrator::Phase;
use crate::prompts::feedback_preamble;
use crate::scope::{enforce_allow_list, snapshot_delta};
use crate::state::verify_transition;
use crate::tools::{ToolServer, ToolSet};
use crate::validators::{validate_plan, validate_stories};

/// Quality-check a candidate plan + PRD pair. Returns the error list to
/// feed back to the agent; empty means the attempt passes.
fn validate_attempt(
    ctx: &RunnerContext,
    item_id: &str,
    expected_branch: &str,
    prd: Option<&Prd>,
) -> Result<Vec<String>> {
    let mut errors = Vec::new();

    if !ctx.repo.has_plan(item_id) {
        errors.push(format!(
            "plan.md was not created at {}",
            rel_item_path(item_id, "plan.md").display()
        ));
    } else {
        let content = ctx.repo.read_plan(item_id)?;
        errors.extend(validate_plan(&content).errors);
    }

    match prd {
        None => errors.push("no PRD was submitted via the save_prd tool".to_string()),
        Some(prd) => {
            if let Err(e) = prd.validate() {
                errors.push(e.to_string());
            } else {
                if prd.id != item_id {
                    errors.push(format!(
                        "PRD id '{}' does not match item '{}'",
                        prd.id, item_id
                    ));
                }
                if prd.branch_name != expected_branch {
                    errors.push(format!(
                        "PRD branch_name '{}' must be '{}'",
                        prd.branch_name, expected_branch
                    ));
                }
                errors.extend(validate_stories(prd).errors);
            }
        }
    }

    Ok(errors)
}

pub async fn run(ctx: &RunnerContext, item_id: &str, force: bool) -> Result<PhaseResult> {
    let mut item = ctx.repo.load_item(item_id)?;
    let run_id = ctx.new_run_id();
    let expected_branch = item.branch_name(&ctx.config.settings.branch_prefix);

    if item.state != ItemState::Researched && !force {
        let err = WorkflowError::WrongState {
            id: item.id.clone(),
            expected: ItemState::Researched,
            actual: item.state,
        };
        return Ok(ctx.fail_phase(item, err));
    }

    // Idempotent re-entry: existing artifacts that pass quality upgrade the
    // state without an agent run.
    if ctx.repo.has_plan(item_id) && ctx.repo.has_prd(item_id) && !force {
        let disk_prd = ctx.repo.load_prd(item_id).ok();
        let errors = validate_attempt(ctx, item_id, &expected_branch, disk_prd.as_ref())?;
        if errors.is_empty() {
            let vctx = ctx.repo.validation_context(&item);
            if let Err(err) = verify_transition(&item, ItemState::Planned, &vctx, force) {
                return Ok(ctx.fail_phase(item, err));
            }
            info!(item = item_id, "plan.md and prd.json already present and valid, upgrading state");
            item.state = ItemState::Planned;
            item.last_error = None;
            ctx.repo.save_item(&mut item)?;
            emit(
                &ctx.events,
                WorkflowEvent::PhaseChanged {
                    item_id: item.id.clone(),
                    state: item.state,
                },
            );
            return Ok(PhaseResult::ok(item));
        }
        warn!(item = item_id, ?errors, "existing plan artifacts fail quality, re-running agent");
    }

    let research = ctx.repo.read_research(item_id).unwrap_or_default();
    let plan_rel = rel_item_path(item_id, "plan.md");
    let scope = ctx.scope();
    let before = scope.capture()?;
    let timeout = ctx.config.timeout_for(Phase::Plan);
    let allowed = vec![plan_rel.clone(), rel_item_path(item_id, "prd.json")];
    let mut feedback: Vec<String> = Vec::new();

    for attempt in 1..=MAX_VALIDATION_ATTEMPTS {
        // Fresh tool server per attempt so stale submissions cannot leak in
        let mut tool_server = ToolServer::new(ToolSet::Plan);
        let tool_url = tool_server.start().await?;

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("item_id", item.id.clone());
        vars.insert("title", item.title.clone());
        vars.insert("overview", item.overview.clone());
        vars.insert("research", research.clone());
        vars.insert("plan_path", plan_rel.to_string_lossy().to_string());
        vars.insert("branch_name", expected_branch.clone());
        vars.insert("tool_server_url", tool_url.clone());
        let base_prompt = ctx.prompts.render("plan", &vars)?;
        let prompt = if feedback.is_empty() {
            base_prompt
        } else {
            format!("{}{}", feedback_preamble(&feedback), base_prompt)
        };

        info!(item = item_id, attempt, "running plan agent");
        let outcome = ctx
            .agent
            .run(
                AgentInvocation {
                    prompt,
                    cwd: ctx.config.project_dir.clone(),
                    allowed_tools: PLAN_TOOLS.iter().map(|s| s.to_string()).collect(),
                    tool_server_url: Some(tool_url),
                    timeout_secs: timeout,
                },
                ctx.events.clone(),
            )
            .await?;

        let captured = tool_server.take_captured_prd().await;
        tool_server.stop().await;

        if let Some(err) = outcome.failure_error(timeout) {
            return Ok(ctx.fail_phase(item, err));
        }

        // The agent may also have written prd.json directly; the tool
        // submission wins when both exist.
        let candidate = match captured {
            Some(prd) => Some(prd),
            None => ctx.repo.load_prd(item_id).ok(),
        };

        let errors = validate_attempt(ctx, item_id, &expected_branch, candidate.as_ref())?;
        if !errors.is_empty() {
            info!(item = item_id, attempt, ?errors, "plan attempt rejected");
            feedback = errors;
            continue;
        }

        let after = scope.capture()?;
        let delta = snapshot_delta(&before, &after);
        if let Err(err) = enforce_allow_list("plan", &delta, &allowed) {
            return Ok(ctx.fail_phase(item, err));
        }

        // Flush the buffered PRD now that the attempt as a whole passed.
        // validate_attempt rejects a missing PRD, so candidate is present here.
        let Some(prd) = candidate else {
            continue;
        };
        ctx.repo.save_prd(item_id, &prd)?;

        let vctx = ctx.repo.validation_context(&item);
        if let Err(err) = verify_transition(&item, ItemState::Planned, &vctx, force) {
            return Ok(ctx.fail_phase(item, err));
        }

        item.state = ItemState::Planned;
        item.last_error = None;
        ctx.repo.save_item(&mut item)?;
        ctx.repo.append_progress(
            item_id,
            &format!(
                "PLAN({}) completed: {} stories captured",
                run_id,
                prd.user_stories.len()
            ),
        )?;
        emit(
            &ctx.events,
            WorkflowEvent::PhaseChanged {
                item_id: item.id.clone(),
                state: item.state,
            },
        );
        return Ok(PhaseResult::ok(item));
    }

    let err = WorkflowError::ValidationFailed {
        attempts: MAX_VALIDATION_ATTEMPTS,
        message: feedback.join("; "),
    };
    Ok(ctx.fail_phase(item, err))
}
