//! Implement phase: drive the agent story by story until every PRD story is
//! done, applying `update_story_status` tool calls between iterations.
//!
//! Story updates are buffered by the tool server during one iteration and
//! flushed to `prd.json` at iteration end; the loop is bounded by the
//! configured `max_iterations`.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{info, warn};

use super::{IMPLEMENT_TOOLS, PhaseResult, RunnerContext, rel_item_dir};
use crate::agent::AgentInvocation;
use crate::errors::WorkflowError;
use crate::events::{WorkflowEvent, emit};
use crate::item::{ItemState, StoryStatus, UserStory};
use crate::orchestrator::Phase;
use crate::scope::{metadata_scope_creep, snapshot_delta};
use crate::state::verify_transition;
use crate::tools::{ToolServer, ToolSet};
use crate::validators::verify_story_completion;

fn story_block(story: &UserStory) -> String {
    let criteria = story
        .acceptance_criteria
        .iter()
        .map(|c| format!("- {}", c))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "### {} (priority {}): {}\n\nAcceptance criteria:\n{}\n",
        story.id, story.priority, story.title, criteria
    )
}

pub async fn run(ctx: &RunnerContext, item_id: &str, force: bool) -> Result<PhaseResult> {
    let mut item = ctx.repo.load_item(item_id)?;
    let run_id = ctx.new_run_id();

    if !matches!(item.state, ItemState::Planned | ItemState::Implementing) && !force {
        let err = WorkflowError::WrongState {
            id: item.id.clone(),
            expected: ItemState::Planned,
            actual: item.state,
        };
        return Ok(ctx.fail_phase(item, err));
    }

    if !ctx.repo.has_prd(item_id) {
        let err = WorkflowError::MissingArtifact("prd.json".to_string());
        return Ok(ctx.fail_phase(item, err));
    }

    if item.state == ItemState::Planned {
        let vctx = ctx.repo.validation_context(&item);
        if let Err(err) = verify_transition(&item, ItemState::Implementing, &vctx, force) {
            return Ok(ctx.fail_phase(item, err));
        }
        item.state = ItemState::Implementing;
        ctx.repo.save_item(&mut item)?;
        emit(
            &ctx.events,
            WorkflowEvent::PhaseChanged {
                item_id: item.id.clone(),
                state: item.state,
            },
        );
    }

    let mut prd = match ctx.repo.load_prd(item_id) {
        Ok(prd) => prd,
        Err(err) => return Ok(ctx.fail_phase(item, err)),
    };

    if prd.all_stories_done() {
        info!(item = item_id, "all stories already done");
        item.last_error = None;
        ctx.repo.save_item(&mut item)?;
        return Ok(PhaseResult::ok(item));
    }

    let research = ctx.repo.read_research(item_id).unwrap_or_default();
    let plan = ctx.repo.read_plan(item_id).unwrap_or_default();
    let scope = ctx.scope();
    let max_iterations = ctx.config.settings.max_iterations;
    let timeout = ctx.config.timeout_for(Phase::Implement);
    let item_dir_rel = rel_item_dir(item_id);
    let metadata_rel = std::path::PathBuf::from(".wreckit");

    for iteration in 1..=max_iterations {
        let Some(story) = prd.next_pending_story().cloned() else {
            break;
        };
        emit(
            &ctx.events,
            WorkflowEvent::StoryChanged {
                item_id: item.id.clone(),
                story_id: story.id.clone(),
            },
        );
        emit(
            &ctx.events,
            WorkflowEvent::IterationChanged {
                item_id: item.id.clone(),
                iteration,
                max: max_iterations,
            },
        );

        let before = scope.capture()?;
        let mut tool_server = ToolServer::new(ToolSet::Implement);
        let tool_url = tool_server.start().await?;

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("item_id", item.id.clone());
        vars.insert("title", item.title.clone());
        vars.insert("story", story_block(&story));
        vars.insert("story_id", story.id.clone());
        vars.insert("prd", serde_json::to_string_pretty(&prd)?);
        vars.insert("plan", plan.clone());
        vars.insert("research", research.clone());
        vars.insert("progress", ctx.repo.read_progress(item_id)?);
        vars.insert("tool_server_url", tool_url.clone());
        let prompt = ctx.prompts.render("implement", &vars)?;

        info!(item = item_id, iteration, story = %story.id, "running implement agent");
        let outcome = ctx
            .agent
            .run(
                AgentInvocation {
                    prompt,
                    cwd: ctx.config.project_dir.clone(),
                    allowed_tools: IMPLEMENT_TOOLS.iter().map(|s| s.to_string()).collect(),
                    tool_server_url: Some(tool_url),
                    timeout_secs: timeout,
                },
                ctx.events.clone(),
            )
            .await?;

        let updates = tool_server.drain_story_updates().await;
        tool_server.stop().await;

        if let Some(err) = outcome.failure_error(timeout) {
            return Ok(ctx.fail_phase(item, err));
        }

        // Apply updates in the exact order the agent emitted them
        for update in &updates {
            let Some(target) = prd.story_mut(&update.story_id) else {
                warn!(item = item_id, story = %update.story_id, "agent updated unknown story");
                continue;
            };
            target.status = update.status;
            if let Some(verification) = &update.verification
                && !verification.trim().is_empty()
            {
                target.notes = verification.clone();
            }
            ctx.repo.append_progress(
                item_id,
                &format!("{} -> {}", update.story_id, update.status),
            )?;

            if update.status == StoryStatus::Done {
                let progress_log = ctx.repo.read_progress(item_id)?;
                let snapshot = target.clone();
                let verification = verify_story_completion(&snapshot, &progress_log);
                for warning in &verification.warnings {
                    warn!(item = item_id, story = %snapshot.id, "{}", warning);
                    ctx.repo
                        .append_progress(item_id, &format!("VERIFY WARNING: {}", warning))?;
                }
                for error in &verification.errors {
                    warn!(item = item_id, story = %snapshot.id, "verification error: {}", error);
                    ctx.repo
                        .append_progress(item_id, &format!("VERIFY ERROR: {}", error))?;
                }
            }
        }
        ctx.repo.save_prd(item_id, &prd)?;

        // Metadata writes outside the item's own directory are flagged but
        // never fatal in this phase
        let after = scope.capture()?;
        let delta = snapshot_delta(&before, &after);
        for path in metadata_scope_creep(&delta, &metadata_rel, &item_dir_rel) {
            warn!(item = item_id, path = %path.display(), "scope creep into engine metadata");
            ctx.repo.append_progress(
                item_id,
                &format!("SCOPE WARNING: modified {}", path.display()),
            )?;
        }

        ctx.repo.append_progress(
            item_id,
            &format!(
                "IMPLEMENT({}) iteration {}/{}: worked {}, {} update(s), {} story(ies) pending",
                run_id,
                iteration,
                max_iterations,
                story.id,
                updates.len(),
                prd.pending_story_count()
            ),
        )?;

        if prd.all_stories_done() {
            break;
        }
    }

    if !prd.all_stories_done() {
        let err = WorkflowError::ValidationFailed {
            attempts: max_iterations,
            message: format!(
                "{} story(ies) still pending after {} iterations",
                prd.pending_story_count(),
                max_iterations
            ),
        };
        return Ok(ctx.fail_phase(item, err));
    }

    // Clear the current-story notification for observers
    emit(
        &ctx.events,
        WorkflowEvent::StoryChanged {
            item_id: item.id.clone(),
            story_id: String::new(),
        },
    );
    item.last_error = None;
    ctx.repo.save_item(&mut item)?;
    Ok(PhaseResult::ok(item))
}
