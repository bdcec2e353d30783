//! PR phase: land finished work on the base branch.
//!
//! The runner walks a fixed sequence and aborts on the first failure:
//! branch setup, auto-commit of the dirty tree, git preflight, quality
//! gates, remote-URL validation, then the configured merge mode. Direct
//! mode captures a rollback SHA before touching the base branch; pr mode
//! pushes the item branch, asks the agent for a PR description, and opens
//! (or updates) the pull request. The direct-merge opt-in is checked before
//! any git mutation.

use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};

use super::{PR_TOOLS, PhaseResult, RunnerContext};
use crate::agent::AgentInvocation;
use crate::config::MergeMode;
use crate::errors::WorkflowError;
use crate::events::{WorkflowEvent, emit};
use crate::item::{Item, ItemState};
use crate::orchestrator::Phase;
use crate::state::verify_transition;
use crate::util::extract_between;

pub const PR_JSON_START: &str = "PR_JSON_START";
pub const PR_JSON_END: &str = "PR_JSON_END";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PrDescription {
    pub title: String,
    pub body: String,
}

/// Extract the agent's PR description from its delimited output block.
fn parse_pr_description(output: &str) -> Option<PrDescription> {
    let block = extract_between(output, PR_JSON_START, PR_JSON_END)?;
    serde_json::from_str(block).ok()
}

fn default_description(item: &Item) -> PrDescription {
    PrDescription {
        title: format!("feat: {}", item.title),
        body: format!(
            "## Summary\n\nAutomated implementation of **{}** (`{}`).\n\n{}",
            item.title, item.id, item.overview
        ),
    }
}

/// Ask the agent for a PR description; any failure falls back to the
/// default, since a missing description must not block the phase.
async fn generate_description(ctx: &RunnerContext, item: &Item) -> PrDescription {
    let mut vars: HashMap<&str, String> = HashMap::new();
    vars.insert("item_id", item.id.clone());
    vars.insert("title", item.title.clone());
    vars.insert("overview", item.overview.clone());
    vars.insert("base_branch", ctx.config.settings.base_branch.clone());
    let prompt = match ctx.prompts.render("pr", &vars) {
        Ok(prompt) => prompt,
        Err(e) => {
            warn!(item = %item.id, error = %e, "pr prompt failed to render, using default description");
            return default_description(item);
        }
    };

    let timeout = ctx.config.timeout_for(Phase::Pr);
    let outcome = ctx
        .agent
        .run(
            AgentInvocation {
                prompt,
                cwd: ctx.config.project_dir.clone(),
                allowed_tools: PR_TOOLS.iter().map(|s| s.to_string()).collect(),
                tool_server_url: None,
                timeout_secs: timeout,
            },
            ctx.events.clone(),
        )
        .await;

    match outcome {
        Ok(outcome) if outcome.success => match parse_pr_description(&outcome.output) {
            Some(description) => description,
            None => {
                warn!(item = %item.id, "no PR_JSON block in agent output, using default description");
                default_description(item)
            }
        },
        Ok(outcome) => {
            warn!(item = %item.id, exit_code = outcome.exit_code, "pr description agent failed, using default");
            default_description(item)
        }
        Err(e) => {
            warn!(item = %item.id, error = %e, "pr description agent errored, using default");
            default_description(item)
        }
    }
}

pub async fn run(ctx: &RunnerContext, item_id: &str, force: bool) -> Result<PhaseResult> {
    let mut item = ctx.repo.load_item(item_id)?;
    let run_id = ctx.new_run_id();
    let settings = ctx.config.settings.clone();

    let critique_passed = item.state == ItemState::Critique;
    let critique_waived = item.state == ItemState::Implementing && !settings.require_critique;
    if !critique_passed && !critique_waived && !force {
        let err = WorkflowError::WrongState {
            id: item.id.clone(),
            expected: ItemState::Critique,
            actual: item.state,
        };
        return Ok(ctx.fail_phase(item, err));
    }

    let prd = match ctx.repo.load_prd(item_id) {
        Ok(prd) => prd,
        Err(err) => return Ok(ctx.fail_phase(item, err)),
    };
    if !prd.all_stories_done() {
        let err = WorkflowError::MissingArtifact(format!(
            "completed user stories ({} still pending)",
            prd.pending_story_count()
        ));
        return Ok(ctx.fail_phase(item, err));
    }

    // Safety check up front, before any git mutation
    if settings.merge_mode == MergeMode::Direct && !settings.pr_checks.allow_unsafe_direct_merge {
        return Ok(ctx.fail_phase(item, WorkflowError::DirectMergeUnsafe));
    }

    // 1. Branch setup
    let branch = item.branch_name(&settings.branch_prefix);
    if let Err(e) = ctx.git.ensure_branch(&settings.base_branch, &branch).await {
        return Ok(ctx.fail_phase(item, WorkflowError::Other(e)));
    }
    match ctx.git.get_current_branch().await {
        Ok(Some(current)) if current == branch => {}
        Ok(current) => {
            let err = WorkflowError::GitPreflight {
                errors: vec![format!(
                    "expected to be on '{}' but HEAD is {}",
                    branch,
                    current.unwrap_or_else(|| "detached".to_string())
                )],
            };
            return Ok(ctx.fail_phase(item, err));
        }
        Err(e) => return Ok(ctx.fail_phase(item, WorkflowError::Other(e))),
    }
    item.branch = Some(branch.clone());
    ctx.repo.save_item(&mut item)?;

    // 2. Auto-commit before preflight, which rejects a dirty tree
    match ctx.git.has_uncommitted_changes().await {
        Ok(true) => {
            let message = format!(
                "feat({}): implement {}",
                item.id.replace('/', "-"),
                item.title
            );
            info!(item = item_id, "committing working tree changes");
            if let Err(e) = ctx.git.commit_all(&message).await {
                return Ok(ctx.fail_phase(item, WorkflowError::Other(e)));
            }
        }
        Ok(false) => {}
        Err(e) => return Ok(ctx.fail_phase(item, WorkflowError::Other(e))),
    }

    // 3. Preflight (remote sync is checked by push/merge itself)
    match ctx
        .git
        .check_git_preflight(&settings.base_branch, false)
        .await
    {
        Ok(preflight) if preflight.passed() => {}
        Ok(preflight) => {
            let err = WorkflowError::GitPreflight {
                errors: preflight.messages(),
            };
            return Ok(ctx.fail_phase(item, err));
        }
        Err(e) => return Ok(ctx.fail_phase(item, WorkflowError::Other(e))),
    }

    // 4. Quality gates
    match ctx
        .git
        .run_pre_push_quality_gates(&settings.pr_checks.checks)
        .await
    {
        Ok(gates) => {
            for skipped in &gates.skipped {
                info!(item = item_id, check = %skipped, "quality gate skipped (disabled)");
            }
            if !gates.success {
                let err = WorkflowError::QualityGate {
                    failed: gates.failed,
                };
                return Ok(ctx.fail_phase(item, err));
            }
        }
        Err(e) => return Ok(ctx.fail_phase(item, WorkflowError::Other(e))),
    }

    // 5. Remote URL validation
    match ctx
        .git
        .validate_remote_url("origin", &settings.pr_checks.allowed_remote_patterns)
        .await
    {
        Ok(validation) if validation.valid => {}
        Ok(validation) => {
            let err = WorkflowError::RemoteValidation {
                remote: "origin".to_string(),
                actual: validation.actual_url,
            };
            return Ok(ctx.fail_phase(item, err));
        }
        Err(e) => return Ok(ctx.fail_phase(item, WorkflowError::Other(e))),
    }

    // 6. Merge-mode branching
    match settings.merge_mode {
        MergeMode::Direct => run_direct_merge(ctx, item, &branch, &run_id, force).await,
        MergeMode::Pr => run_pr_mode(ctx, item, &branch, &run_id, force).await,
    }
}

async fn run_direct_merge(
    ctx: &RunnerContext,
    mut item: Item,
    branch: &str,
    run_id: &str,
    force: bool,
) -> Result<PhaseResult> {
    let settings = &ctx.config.settings;
    let base = settings.base_branch.clone();

    match ctx.git.check_merge_conflicts(&base, branch).await {
        Ok(check) => {
            if let Some(probe_error) = check.error {
                return Ok(ctx.fail_phase(item, WorkflowError::Other(anyhow!(probe_error))));
            }
            if check.has_conflicts {
                let err = WorkflowError::MergeConflict {
                    base,
                    head: branch.to_string(),
                };
                return Ok(ctx.fail_phase(item, err));
            }
        }
        Err(e) => return Ok(ctx.fail_phase(item, WorkflowError::Other(e))),
    }

    // Rollback anchor: tip of base immediately before the merge. Persisted
    // with the final save below; writing item.json between branch switches
    // would dirty the tree and make the merge checkout refuse.
    let rollback_sha = match ctx.git.get_branch_sha(&base).await {
        Ok(Some(sha)) => sha,
        Ok(None) => {
            let err = WorkflowError::Other(anyhow!("base branch '{}' has no commits", base));
            return Ok(ctx.fail_phase(item, err));
        }
        Err(e) => return Ok(ctx.fail_phase(item, WorkflowError::Other(e))),
    };
    item.rollback_sha = Some(rollback_sha.clone());

    let message = format!("merge {}: {}", branch, item.title);
    if let Err(e) = ctx.git.merge_and_push_to_base(&base, branch, &message).await {
        return Ok(ctx.fail_phase(item, WorkflowError::Other(e)));
    }

    match ctx.git.base_in_sync_with_remote(&base).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(item = %item.id, base = %base, "local base diverged from origin after push");
            ctx.repo.append_progress(
                &item.id,
                &format!("WARNING: local {} diverged from origin after push", base),
            )?;
        }
        Err(e) => warn!(item = %item.id, error = %e, "could not verify remote sync"),
    }

    let vctx = ctx.repo.validation_context(&item);
    if let Err(err) = verify_transition(&item, ItemState::Done, &vctx, force) {
        return Ok(ctx.fail_phase(item, err));
    }
    item.completed_at = Some(chrono::Utc::now());
    item.state = ItemState::Done;
    item.last_error = None;
    ctx.repo.save_item(&mut item)?;
    ctx.repo.append_progress(
        &item.id,
        &format!(
            "COMPLETE({}) direct merge to {}; rollback SHA {}; recovery: git reset --hard {}",
            run_id, base, rollback_sha, rollback_sha
        ),
    )?;

    if settings.branch_cleanup.enabled {
        let cleanup = ctx
            .git
            .cleanup_branch(branch, &base, settings.branch_cleanup.delete_remote)
            .await;
        if let Some(problem) = cleanup.error {
            warn!(item = %item.id, "branch cleanup incomplete: {}", problem);
        }
    }

    emit(
        &ctx.events,
        WorkflowEvent::PhaseChanged {
            item_id: item.id.clone(),
            state: item.state,
        },
    );
    Ok(PhaseResult::ok(item))
}

async fn run_pr_mode(
    ctx: &RunnerContext,
    mut item: Item,
    branch: &str,
    run_id: &str,
    force: bool,
) -> Result<PhaseResult> {
    let settings = &ctx.config.settings;
    let base = settings.base_branch.clone();

    if let Err(e) = ctx.git.push_branch(branch).await {
        return Ok(ctx.fail_phase(item, WorkflowError::Other(e)));
    }

    let description = generate_description(ctx, &item).await;

    let pr = match ctx
        .git
        .create_or_update_pr(&base, branch, &description.title, &description.body)
        .await
    {
        Ok(pr) => pr,
        Err(e) => return Ok(ctx.fail_phase(item, WorkflowError::PrToolError(e.to_string()))),
    };

    let mergeability_note = match ctx.git.check_pr_mergeability(pr.number).await {
        Ok(m) if !m.determined => {
            info!(item = %item.id, pr = pr.number, "PR mergeability not yet determined");
            Some("PR mergeability not yet determined".to_string())
        }
        Ok(m) if m.mergeable => {
            info!(item = %item.id, pr = pr.number, "PR is mergeable");
            None
        }
        Ok(_) => {
            warn!(item = %item.id, pr = pr.number, "PR has conflicts");
            Some("PR has conflicts".to_string())
        }
        Err(e) => {
            warn!(item = %item.id, error = %e, "PR mergeability query failed");
            None
        }
    };

    item.pr_url = Some(pr.url.clone());
    item.pr_number = Some(pr.number);
    item.branch = Some(branch.to_string());

    // When critique gating is disabled, pr entry from `implementing` skips
    // the critique edge; relax only the ordering check.
    let bypass_ordering =
        force || (item.state == ItemState::Implementing && !settings.require_critique);
    let vctx = ctx.repo.validation_context(&item);
    if let Err(err) = verify_transition(&item, ItemState::InPr, &vctx, bypass_ordering) {
        return Ok(ctx.fail_phase(item, err));
    }

    // Switch back to base while the tree is still clean; the item record is
    // saved afterwards so the write lands on the base worktree.
    if let Err(e) = ctx.git.checkout(&base).await {
        warn!(item = %item.id, error = %e, "could not switch back to base branch");
    }

    item.state = ItemState::InPr;
    item.last_error = None;
    ctx.repo.save_item(&mut item)?;
    if let Some(note) = mergeability_note {
        ctx.repo.append_progress(&item.id, &note)?;
    }
    ctx.repo.append_progress(
        &item.id,
        &format!(
            "PR({}) {} #{}: {}",
            run_id,
            if pr.created { "created" } else { "updated" },
            pr.number,
            pr.url
        ),
    )?;

    emit(
        &ctx.events,
        WorkflowEvent::PhaseChanged {
            item_id: item.id.clone(),
            state: item.state,
        },
    );
    Ok(PhaseResult::ok(item))
}
