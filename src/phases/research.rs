//! Research phase: drive the agent to produce `research.md`, validate its
//! quality, and advance the item from `idea` to `researched`.
//!
//! Validation failures feed back into up to three agent attempts; agent
//! system failures and scope violations fail the phase immediately.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{info, warn};

use super::{MAX_VALIDATION_ATTEMPTS, PhaseResult, RESEARCH_TOOLS, RunnerContext, rel_item_path};
use crate::agent::AgentInvocation;
use crate::errors::WorkflowError;
use crate::events::{WorkflowEvent, emit};
use crate::item::ItemState;
use crate::orchestrator::Phase;
use crate::prompts::feedback_preamble;
use crate::scope::{enforce_allow_list, snapshot_delta};
use crate::state::verify_transition;
use crate::validators::validate_research;

pub async fn run(ctx: &RunnerContext, item_id: &str, force: bool) -> Result<PhaseResult> {
    let mut item = ctx.repo.load_item(item_id)?;
    let run_id = ctx.new_run_id();

    if item.state != ItemState::Idea && !force {
        let err = WorkflowError::WrongState {
            id: item.id.clone(),
            expected: ItemState::Idea,
            actual: item.state,
        };
        return Ok(ctx.fail_phase(item, err));
    }

    // Idempotent re-entry: an existing research.md that already passes
    // quality upgrades the state without an agent run.
    if ctx.repo.has_research(item_id) && !force {
        let content = ctx.repo.read_research(item_id)?;
        let validation = validate_research(&content);
        if validation.valid {
            let vctx = ctx.repo.validation_context(&item);
            if let Err(err) = verify_transition(&item, ItemState::Researched, &vctx, force) {
                return Ok(ctx.fail_phase(item, err));
            }
            info!(item = item_id, "research.md already present and valid, upgrading state");
            item.state = ItemState::Researched;
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
        warn!(item = item_id, errors = ?validation.errors, "existing research.md fails quality, re-running agent");
    }

    let research_rel = rel_item_path(item_id, "research.md");
    let mut vars: HashMap<&str, String> = HashMap::new();
    vars.insert("item_id", item.id.clone());
    vars.insert("title", item.title.clone());
    vars.insert("overview", item.overview.clone());
    vars.insert("research_path", research_rel.to_string_lossy().to_string());
    let base_prompt = ctx.prompts.render("research", &vars)?;

    let scope = ctx.scope();
    let before = scope.capture()?;
    let timeout = ctx.config.timeout_for(Phase::Research);
    let allowed = vec![research_rel.clone()];
    let mut feedback: Vec<String> = Vec::new();

    for attempt in 1..=MAX_VALIDATION_ATTEMPTS {
        let prompt = if feedback.is_empty() {
            base_prompt.clone()
        } else {
            format!("{}{}", feedback_preamble(&feedback), base_prompt)
        };

        info!(item = item_id, attempt, "running research agent");
        let outcome = ctx
            .agent
            .run(
                AgentInvocation {
                    prompt,
                    cwd: ctx.config.project_dir.clone(),
                    allowed_tools: RESEARCH_TOOLS.iter().map(|s| s.to_string()).collect(),
                    tool_server_url: None,
                    timeout_secs: timeout,
                },
                ctx.events.clone(),
            )
            .await?;

        // System failure: no retry
        if let Some(err) = outcome.failure_error(timeout) {
            return Ok(ctx.fail_phase(item, err));
        }

        if !ctx.repo.has_research(item_id) {
            feedback = vec![format!(
                "research.md was not created at {}",
                research_rel.display()
            )];
            continue;
        }

        let content = ctx.repo.read_research(item_id)?;
        let validation = validate_research(&content);
        if !validation.valid {
            info!(item = item_id, attempt, errors = ?validation.errors, "research quality rejected");
            feedback = validation.errors;
            continue;
        }

        // Scope violations are not retryable
        let after = scope.capture()?;
        let delta = snapshot_delta(&before, &after);
        if let Err(err) = enforce_allow_list("research", &delta, &allowed) {
            return Ok(ctx.fail_phase(item, err));
        }

        let vctx = ctx.repo.validation_context(&item);
        if let Err(err) = verify_transition(&item, ItemState::Researched, &vctx, force) {
            return Ok(ctx.fail_phase(item, err));
        }

        item.state = ItemState::Researched;
        item.last_error = None;
        ctx.repo.save_item(&mut item)?;
        ctx.repo.append_progress(
            item_id,
            &format!(
                "RESEARCH({}) completed: {} citations, summary {} chars, analysis {} chars",
                run_id, validation.citations_count, validation.summary_len, validation.analysis_len
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
