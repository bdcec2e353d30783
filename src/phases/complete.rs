//! Complete phase: verify the item's pull request actually merged to the
//! configured base branch, then record completion metadata and clean up.
//!
//! This phase runs no agent; it is a pure PR-tool and git operation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{PhaseResult, RunnerContext};
use crate::errors::WorkflowError;
use crate::events::{WorkflowEvent, emit};
use crate::git::PrDetails;
use crate::item::{Item, ItemState};
use crate::state::verify_transition;

/// Check the queried PR details against expectations and stamp completion
/// metadata on the item. Returns warnings for non-fatal mismatches.
fn apply_pr_details(
    item: &mut Item,
    details: &PrDetails,
    base_branch: &str,
    expected_branch: &str,
) -> Result<Vec<String>, WorkflowError> {
    let number = item.pr_number.unwrap_or_default();

    if !details.query_succeeded {
        return Err(WorkflowError::PrToolError(
            details
                .error
                .clone()
                .unwrap_or_else(|| format!("query for PR #{} failed", number)),
        ));
    }
    if !details.merged {
        return Err(WorkflowError::ValidationFailed {
            attempts: 1,
            message: format!("PR #{} is not merged yet", number),
        });
    }
    if details.base_ref_name != base_branch {
        return Err(WorkflowError::ValidationFailed {
            attempts: 1,
            message: format!(
                "PR #{} merged into '{}' but the configured base branch is '{}'",
                number, details.base_ref_name, base_branch
            ),
        });
    }

    let mut warnings = Vec::new();
    if details.head_ref_name != expected_branch {
        warnings.push(format!(
            "PR #{} head branch '{}' differs from expected '{}'",
            number, details.head_ref_name, expected_branch
        ));
    }

    let now = Utc::now();
    item.merged_at = details
        .merged_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or(Some(now));
    item.merge_commit_sha = details.merge_commit_oid.clone();
    item.checks_passed = Some(details.checks_passed);
    item.completed_at = Some(now);
    Ok(warnings)
}

pub async fn run(ctx: &RunnerContext, item_id: &str, force: bool) -> Result<PhaseResult> {
    let mut item = ctx.repo.load_item(item_id)?;
    let run_id = ctx.new_run_id();
    let settings = ctx.config.settings.clone();

    if item.state != ItemState::InPr && !force {
        let err = WorkflowError::WrongState {
            id: item.id.clone(),
            expected: ItemState::InPr,
            actual: item.state,
        };
        return Ok(ctx.fail_phase(item, err));
    }
    let Some(number) = item.pr_number else {
        let err = WorkflowError::MissingArtifact("pr_number".to_string());
        return Ok(ctx.fail_phase(item, err));
    };

    let details = match ctx.git.get_pr_details(number).await {
        Ok(details) => details,
        Err(e) => return Ok(ctx.fail_phase(item, WorkflowError::PrToolError(e.to_string()))),
    };

    let expected_branch = item
        .branch
        .clone()
        .unwrap_or_else(|| item.branch_name(&settings.branch_prefix));
    let warnings = match apply_pr_details(&mut item, &details, &settings.base_branch, &expected_branch)
    {
        Ok(warnings) => warnings,
        Err(err) => return Ok(ctx.fail_phase(item, err)),
    };
    for warning in &warnings {
        warn!(item = item_id, "{}", warning);
        ctx.repo
            .append_progress(item_id, &format!("WARNING: {}", warning))?;
    }

    let vctx = ctx.repo.validation_context(&item);
    if let Err(err) = verify_transition(&item, ItemState::Done, &vctx, force) {
        return Ok(ctx.fail_phase(item, err));
    }
    item.state = ItemState::Done;
    item.last_error = None;
    ctx.repo.save_item(&mut item)?;
    ctx.repo.append_progress(
        item_id,
        &format!(
            "COMPLETE({}) PR #{} merged to {} (checks passed: {})",
            run_id,
            number,
            settings.base_branch,
            item.checks_passed.unwrap_or_default()
        ),
    )?;

    if settings.branch_cleanup.enabled {
        let cleanup = ctx
            .git
            .cleanup_branch(
                &expected_branch,
                &settings.base_branch,
                settings.branch_cleanup.delete_remote,
            )
            .await;
        if let Some(problem) = cleanup.error {
            warn!(item = item_id, "branch cleanup incomplete: {}", problem);
        }
    } else if let Err(e) = ctx.git.checkout(&settings.base_branch).await {
        warn!(item = item_id, error = %e, "could not switch back to base branch");
    }

    info!(item = item_id, pr = number, "item complete");
    emit(
        &ctx.events,
        WorkflowEvent::PhaseChanged {
            item_id: item.id.clone(),
            state: item.state,
        },
    );
    Ok(PhaseResult::ok(item))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::testkit::*;

    fn in_pr_item() -> Item {
        let mut item = Item::new("demo", "Demo item").unwrap();
        item.state = ItemState::InPr;
        item.pr_url = Some("https://github.com/acme/repo/pull/7".to_string());
        item.pr_number = Some(7);
        item.branch = Some("wreckit/demo".to_string());
        item
    }

    fn merged_details() -> PrDetails {
        PrDetails {
            query_succeeded: true,
            merged: true,
            base_ref_name: "main".to_string(),
            head_ref_name: "wreckit/demo".to_string(),
            merged_at: Some("2026-02-01T10:00:00Z".to_string()),
            merge_commit_oid: Some("abc123".to_string()),
            checks_passed: true,
            error: None,
        }
    }

    // =========================================
    // apply_pr_details
    // =========================================

    #[test]
    fn test_apply_details_happy_path() {
        let mut item = in_pr_item();
        let warnings =
            apply_pr_details(&mut item, &merged_details(), "main", "wreckit/demo").unwrap();
        assert!(warnings.is_empty());
        assert_eq!(item.merge_commit_sha.as_deref(), Some("abc123"));
        assert_eq!(item.checks_passed, Some(true));
        assert!(item.completed_at.is_some());
        assert_eq!(
            item.merged_at.unwrap().to_rfc3339(),
            "2026-02-01T10:00:00+00:00"
        );
    }

    #[test]
    fn test_apply_details_wrong_base_fails() {
        let mut item = in_pr_item();
        let mut details = merged_details();
        details.base_ref_name = "develop".to_string();
        let err = apply_pr_details(&mut item, &details, "main", "wreckit/demo").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("develop"));
        assert!(msg.contains("main"));
    }

    #[test]
    fn test_apply_details_not_merged_fails() {
        let mut item = in_pr_item();
        let mut details = merged_details();
        details.merged = false;
        let err = apply_pr_details(&mut item, &details, "main", "wreckit/demo").unwrap_err();
        assert!(err.to_string().contains("not merged"));
    }

    #[test]
    fn test_apply_details_query_failure_surfaces_tool_error() {
        let mut item = in_pr_item();
        let details = PrDetails {
            query_succeeded: false,
            error: Some("gh: could not resolve PR".to_string()),
            ..Default::default()
        };
        let err = apply_pr_details(&mut item, &details, "main", "wreckit/demo").unwrap_err();
        assert!(matches!(err, WorkflowError::PrToolError(_)));
        assert!(err.to_string().contains("could not resolve"));
    }

    #[test]
    fn test_apply_details_head_mismatch_warns_but_passes() {
        let mut item = in_pr_item();
        let mut details = merged_details();
        details.head_ref_name = "someone-elses-branch".to_string();
        let warnings =
            apply_pr_details(&mut item, &details, "main", "wreckit/demo").unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("someone-elses-branch"));
        assert!(item.completed_at.is_some());
    }

    #[test]
    fn test_apply_details_unparseable_merged_at_falls_back_to_now() {
        let mut item = in_pr_item();
        let mut details = merged_details();
        details.merged_at = Some("yesterday-ish".to_string());
        apply_pr_details(&mut item, &details, "main", "wreckit/demo").unwrap();
        assert!(item.merged_at.is_some());
    }

    // =========================================
    // Runner guards
    // =========================================

    #[tokio::test]
    async fn test_complete_wrong_state_guard() {
        let project = TestProject::new("demo", ItemState::Implementing);
        let agent = ScriptedAgent::new(vec![]);
        let ctx = project.ctx(agent.clone());
        let result = run(&ctx, "demo", false).await.unwrap();
        assert!(!result.success);
        assert!(matches!(result.error, Some(WorkflowError::WrongState { .. })));
    }

    #[tokio::test]
    async fn test_complete_requires_pr_number() {
        let project = TestProject::new("demo", ItemState::InPr);
        // Seeded item has no pr_number
        let agent = ScriptedAgent::new(vec![]);
        let ctx = project.ctx(agent.clone());
        let result = run(&ctx, "demo", false).await.unwrap();
        assert!(!result.success);
        assert!(matches!(result.error, Some(WorkflowError::MissingArtifact(_))));
        assert_eq!(agent.call_count(), 0);
    }
}
