//! Git and PR-tool integration.
//!
//! Every version-control side effect goes through a thin shell wrapper
//! around `git` (and `gh` for the PR surface), run from the project root.
//! Operations return structured results; command failure is data, not a
//! panic, and callers translate results into typed `WorkflowError`s.
//!
//! The conflict pre-check performs a real dry-run merge on a detached
//! scratch HEAD and unconditionally rolls back to the previous branch, so a
//! conflicted probe never leaves the working copy mid-merge.

use anyhow::{Context, Result, anyhow};
use glob::Pattern;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Output of one shell command, collected.
#[derive(Debug, Clone)]
struct CmdOutput {
    success: bool,
    code: i32,
    stdout: String,
    stderr: String,
}

impl CmdOutput {
    fn stdout_trimmed(&self) -> String {
        self.stdout.trim().to_string()
    }
}

/// One preflight failure with a recovery hint for the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightError {
    pub message: String,
    pub recovery: String,
}

/// Result of the pre-push preflight checks.
#[derive(Debug, Clone, Default)]
pub struct PreflightResult {
    pub errors: Vec<PreflightError>,
}

impl PreflightResult {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.recovery))
            .collect()
    }
}

/// Result of the dry-run merge-conflict probe.
#[derive(Debug, Clone)]
pub struct MergeConflictCheck {
    pub has_conflicts: bool,
    pub error: Option<String>,
}

/// Result of running the configured quality gates.
#[derive(Debug, Clone, Default)]
pub struct QualityGateResult {
    pub success: bool,
    /// Names of checks that exited non-zero
    pub failed: Vec<String>,
    /// Names of disabled checks that were not run
    pub skipped: Vec<String>,
}

/// Result of validating the remote URL against the allow-list.
#[derive(Debug, Clone)]
pub struct RemoteValidation {
    pub valid: bool,
    pub actual_url: String,
    pub errors: Vec<String>,
}

/// Result of creating or updating a pull request.
#[derive(Debug, Clone)]
pub struct PrCreation {
    pub url: String,
    pub number: u64,
    pub created: bool,
}

/// Result of the post-creation mergeability query.
#[derive(Debug, Clone)]
pub struct PrMergeability {
    pub determined: bool,
    pub mergeable: bool,
}

/// Everything the complete phase needs to know about a PR.
#[derive(Debug, Clone, Default)]
pub struct PrDetails {
    pub query_succeeded: bool,
    pub merged: bool,
    pub base_ref_name: String,
    pub head_ref_name: String,
    pub merged_at: Option<String>,
    pub merge_commit_oid: Option<String>,
    pub checks_passed: bool,
    pub error: Option<String>,
}

/// Result of post-completion branch cleanup.
#[derive(Debug, Clone, Default)]
pub struct CleanupResult {
    pub error: Option<String>,
}

/// Shell-backed git and PR-tool operations for one project.
#[derive(Debug, Clone)]
pub struct Git {
    project_dir: PathBuf,
}

impl Git {
    pub fn new(project_dir: PathBuf) -> Self {
        Self { project_dir }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        debug!(program, ?args, "running");
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run {} {}", program, args.join(" ")))?;
        Ok(CmdOutput {
            success: output.status.success(),
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn git(&self, args: &[&str]) -> Result<CmdOutput> {
        self.run("git", args).await
    }

    async fn gh(&self, args: &[&str]) -> Result<CmdOutput> {
        self.run("gh", args).await
    }

    // =========================================
    // Branch lifecycle
    // =========================================

    pub async fn is_git_repo(&self) -> bool {
        matches!(
            self.git(&["rev-parse", "--is-inside-work-tree"]).await,
            Ok(out) if out.success
        )
    }

    /// Current branch name; `None` when HEAD is detached.
    pub async fn get_current_branch(&self) -> Result<Option<String>> {
        let out = self.git(&["symbolic-ref", "--quiet", "--short", "HEAD"]).await?;
        if out.success {
            Ok(Some(out.stdout_trimmed()))
        } else {
            Ok(None)
        }
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", name);
        let out = self.git(&["rev-parse", "--verify", "--quiet", &refname]).await?;
        Ok(out.success)
    }

    pub async fn get_branch_sha(&self, name: &str) -> Result<Option<String>> {
        let out = self.git(&["rev-parse", "--verify", "--quiet", name]).await?;
        if out.success {
            Ok(Some(out.stdout_trimmed()))
        } else {
            Ok(None)
        }
    }

    /// Check out the named branch, creating it from `base` if it does not
    /// exist locally. Returns whether it was created.
    pub async fn ensure_branch(&self, base: &str, name: &str) -> Result<bool> {
        if self.branch_exists(name).await? {
            let out = self.git(&["checkout", name]).await?;
            if !out.success {
                return Err(anyhow!("Failed to check out branch {}: {}", name, out.stderr.trim()));
            }
            Ok(false)
        } else {
            let out = self.git(&["checkout", "-b", name, base]).await?;
            if !out.success {
                return Err(anyhow!(
                    "Failed to create branch {} from {}: {}",
                    name,
                    base,
                    out.stderr.trim()
                ));
            }
            Ok(true)
        }
    }

    pub async fn checkout(&self, name: &str) -> Result<()> {
        let out = self.git(&["checkout", name]).await?;
        if !out.success {
            return Err(anyhow!("Failed to check out {}: {}", name, out.stderr.trim()));
        }
        Ok(())
    }

    pub async fn has_uncommitted_changes(&self) -> Result<bool> {
        let out = self.git(&["status", "--porcelain"]).await?;
        if !out.success {
            return Err(anyhow!("git status failed: {}", out.stderr.trim()));
        }
        Ok(!out.stdout.trim().is_empty())
    }

    /// Stage everything and commit. Errors if there is nothing to commit.
    pub async fn commit_all(&self, message: &str) -> Result<()> {
        let add = self.git(&["add", "-A"]).await?;
        if !add.success {
            return Err(anyhow!("git add failed: {}", add.stderr.trim()));
        }
        let commit = self.git(&["commit", "-m", message]).await?;
        if !commit.success {
            return Err(anyhow!("git commit failed: {}", commit.stderr.trim()));
        }
        Ok(())
    }

    pub async fn push_branch(&self, name: &str) -> Result<()> {
        let out = self.git(&["push", "-u", "origin", name]).await?;
        if !out.success {
            return Err(anyhow!("Failed to push {}: {}", name, out.stderr.trim()));
        }
        Ok(())
    }

    // =========================================
    // Preflight and gates
    // =========================================

    /// Pre-push sanity checks. `check_remote_sync` additionally verifies the
    /// local base matches `origin`'s base tip.
    pub async fn check_git_preflight(
        &self,
        base_branch: &str,
        check_remote_sync: bool,
    ) -> Result<PreflightResult> {
        let mut result = PreflightResult::default();

        if !self.is_git_repo().await {
            result.errors.push(PreflightError {
                message: "not a git repository".to_string(),
                recovery: "run 'git init' or move to the repository root".to_string(),
            });
            // Nothing else is checkable
            return Ok(result);
        }

        if !self.branch_exists(base_branch).await? {
            result.errors.push(PreflightError {
                message: format!("base branch '{}' does not exist", base_branch),
                recovery: format!("create it with 'git branch {}'", base_branch),
            });
        }

        let unmerged = self.git(&["ls-files", "--unmerged"]).await?;
        if unmerged.success && !unmerged.stdout.trim().is_empty() {
            result.errors.push(PreflightError {
                message: "unresolved merge conflicts in the working tree".to_string(),
                recovery: "resolve conflicts and commit, or 'git merge --abort'".to_string(),
            });
        }

        if self.get_current_branch().await?.is_none() {
            result.errors.push(PreflightError {
                message: "HEAD is detached".to_string(),
                recovery: "check out a branch before running the PR phase".to_string(),
            });
        }

        if check_remote_sync {
            let local = self.get_branch_sha(base_branch).await?;
            let remote = self
                .get_branch_sha(&format!("origin/{}", base_branch))
                .await?;
            if let (Some(local), Some(remote)) = (local, remote)
                && local != remote
            {
                result.errors.push(PreflightError {
                    message: format!("local '{}' is not in sync with origin", base_branch),
                    recovery: format!("run 'git pull origin {}'", base_branch),
                });
            }
        }

        Ok(result)
    }

    /// Run the configured quality gates with `sh -c` from the project root.
    /// Disabled checks are recorded as skipped, not run.
    pub async fn run_pre_push_quality_gates(
        &self,
        checks: &[crate::config::QualityCheck],
    ) -> Result<QualityGateResult> {
        let mut result = QualityGateResult {
            success: true,
            ..Default::default()
        };
        for check in checks {
            if !check.enabled {
                debug!(check = %check.name, "quality gate disabled, skipping");
                result.skipped.push(check.name.clone());
                continue;
            }
            let out = self.run("sh", &["-c", &check.command]).await?;
            if !out.success {
                warn!(check = %check.name, code = out.code, "quality gate failed");
                result.failed.push(check.name.clone());
                result.success = false;
            }
        }
        Ok(result)
    }

    /// Match the remote's URL against the configured allow-list. An empty
    /// pattern list allows any URL.
    pub async fn validate_remote_url(
        &self,
        remote: &str,
        allowed_patterns: &[String],
    ) -> Result<RemoteValidation> {
        let out = self.git(&["remote", "get-url", remote]).await?;
        if !out.success {
            return Ok(RemoteValidation {
                valid: false,
                actual_url: String::new(),
                errors: vec![format!(
                    "remote '{}' is not configured: {}",
                    remote,
                    out.stderr.trim()
                )],
            });
        }
        let actual_url = out.stdout_trimmed();

        if allowed_patterns.is_empty() {
            return Ok(RemoteValidation {
                valid: true,
                actual_url,
                errors: Vec::new(),
            });
        }

        let matched = allowed_patterns.iter().any(|p| {
            Pattern::new(p)
                .map(|pat| pat.matches(&actual_url))
                .unwrap_or(false)
        });
        let errors = if matched {
            Vec::new()
        } else {
            vec![format!(
                "remote '{}' URL '{}' matches none of the allowed patterns",
                remote, actual_url
            )]
        };
        Ok(RemoteValidation {
            valid: matched,
            actual_url,
            errors,
        })
    }

    // =========================================
    // Merging
    // =========================================

    /// Probe for conflicts between `base` and `head` with a dry-run merge on
    /// a detached scratch HEAD. Always rolls back to the previous branch.
    pub async fn check_merge_conflicts(&self, base: &str, head: &str) -> Result<MergeConflictCheck> {
        let Some(previous) = self.get_current_branch().await? else {
            return Ok(MergeConflictCheck {
                has_conflicts: false,
                error: Some("cannot probe for conflicts from a detached HEAD".to_string()),
            });
        };

        let detach = self.git(&["checkout", "--detach", base]).await?;
        if !detach.success {
            return Ok(MergeConflictCheck {
                has_conflicts: false,
                error: Some(format!("failed to detach at {}: {}", base, detach.stderr.trim())),
            });
        }

        let merge = self.git(&["merge", "--no-commit", "--no-ff", head]).await?;
        let has_conflicts = if merge.success {
            false
        } else {
            let unmerged = self.git(&["ls-files", "--unmerged"]).await?;
            !unmerged.stdout.trim().is_empty()
        };

        // Mandatory rollback, regardless of probe outcome
        let _ = self.git(&["merge", "--abort"]).await;
        let restore = self.git(&["checkout", &previous]).await?;
        let error = if restore.success {
            None
        } else {
            Some(format!(
                "conflict probe could not restore branch '{}': {}",
                previous,
                restore.stderr.trim()
            ))
        };

        Ok(MergeConflictCheck {
            has_conflicts,
            error,
        })
    }

    /// Switch to `base`, merge `head` with a merge commit, and push `base`.
    pub async fn merge_and_push_to_base(&self, base: &str, head: &str, message: &str) -> Result<()> {
        let checkout = self.git(&["checkout", base]).await?;
        if !checkout.success {
            return Err(anyhow!("Failed to check out {}: {}", base, checkout.stderr.trim()));
        }
        let merge = self.git(&["merge", "--no-ff", "-m", message, head]).await?;
        if !merge.success {
            let _ = self.git(&["merge", "--abort"]).await;
            return Err(anyhow!("Failed to merge {} into {}: {}", head, base, merge.stderr.trim()));
        }
        let push = self.git(&["push", "origin", base]).await?;
        if !push.success {
            return Err(anyhow!("Failed to push {}: {}", base, push.stderr.trim()));
        }
        Ok(())
    }

    /// After a push, verify local and remote base point at the same commit.
    pub async fn base_in_sync_with_remote(&self, base: &str) -> Result<bool> {
        let fetch = self.git(&["fetch", "origin", base]).await?;
        if !fetch.success {
            return Ok(false);
        }
        let local = self.get_branch_sha(base).await?;
        let remote = self.get_branch_sha(&format!("origin/{}", base)).await?;
        Ok(local.is_some() && local == remote)
    }

    // =========================================
    // PR tool
    // =========================================

    /// Create the PR for `head`, or update title/body if one already exists.
    pub async fn create_or_update_pr(
        &self,
        base: &str,
        head: &str,
        title: &str,
        body: &str,
    ) -> Result<PrCreation> {
        let view = self
            .gh(&["pr", "view", head, "--json", "url,number,state"])
            .await?;
        if view.success
            && let Ok(existing) = serde_json::from_str::<PrViewBrief>(&view.stdout)
            && existing.state == "OPEN"
        {
            let edit = self
                .gh(&[
                    "pr",
                    "edit",
                    &existing.number.to_string(),
                    "--title",
                    title,
                    "--body",
                    body,
                ])
                .await?;
            if !edit.success {
                return Err(anyhow!("gh pr edit failed: {}", edit.stderr.trim()));
            }
            return Ok(PrCreation {
                url: existing.url,
                number: existing.number,
                created: false,
            });
        }

        let create = self
            .gh(&[
                "pr", "create", "--base", base, "--head", head, "--title", title, "--body", body,
            ])
            .await?;
        if !create.success {
            return Err(anyhow!("gh pr create failed: {}", create.stderr.trim()));
        }
        let url = create.stdout_trimmed();
        let number = parse_pr_number(&url)
            .ok_or_else(|| anyhow!("could not parse PR number from gh output '{}'", url))?;
        Ok(PrCreation {
            url,
            number,
            created: true,
        })
    }

    /// Ask the PR tool whether the PR is currently mergeable.
    pub async fn check_pr_mergeability(&self, number: u64) -> Result<PrMergeability> {
        let out = self
            .gh(&["pr", "view", &number.to_string(), "--json", "mergeable"])
            .await?;
        if !out.success {
            return Err(anyhow!("gh pr view failed: {}", out.stderr.trim()));
        }
        #[derive(Deserialize)]
        struct View {
            mergeable: String,
        }
        let view: View = serde_json::from_str(&out.stdout)
            .context("unexpected JSON from gh pr view --json mergeable")?;
        Ok(PrMergeability {
            determined: view.mergeable != "UNKNOWN",
            mergeable: view.mergeable == "MERGEABLE",
        })
    }

    /// Full PR details for the complete phase. Query failure is data, not
    /// an error.
    pub async fn get_pr_details(&self, number: u64) -> Result<PrDetails> {
        let out = self
            .gh(&[
                "pr",
                "view",
                &number.to_string(),
                "--json",
                "merged,mergedAt,baseRefName,headRefName,mergeCommit,statusCheckRollup",
            ])
            .await?;
        if !out.success {
            return Ok(PrDetails {
                query_succeeded: false,
                error: Some(out.stderr.trim().to_string()),
                ..Default::default()
            });
        }
        match parse_pr_details(&out.stdout) {
            Ok(details) => Ok(details),
            Err(e) => Ok(PrDetails {
                query_succeeded: false,
                error: Some(e.to_string()),
                ..Default::default()
            }),
        }
    }

    // =========================================
    // Cleanup
    // =========================================

    /// Switch back to `base` and delete the work branch, optionally on the
    /// remote too. Failures are reported, never raised.
    pub async fn cleanup_branch(&self, name: &str, base: &str, delete_remote: bool) -> CleanupResult {
        let mut problems = Vec::new();

        match self.git(&["checkout", base]).await {
            Ok(out) if out.success => {}
            Ok(out) => problems.push(format!("checkout {}: {}", base, out.stderr.trim())),
            Err(e) => problems.push(e.to_string()),
        }

        match self.git(&["branch", "-D", name]).await {
            Ok(out) if out.success => {}
            Ok(out) => problems.push(format!("delete {}: {}", name, out.stderr.trim())),
            Err(e) => problems.push(e.to_string()),
        }

        if delete_remote {
            match self.git(&["push", "origin", "--delete", name]).await {
                Ok(out) if out.success => {}
                Ok(out) => problems.push(format!("delete remote {}: {}", name, out.stderr.trim())),
                Err(e) => problems.push(e.to_string()),
            }
        }

        CleanupResult {
            error: if problems.is_empty() {
                None
            } else {
                Some(problems.join("; "))
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct PrViewBrief {
    url: String,
    number: u64,
    #[serde(default)]
    state: String,
}

/// Parse the PR number from a `gh pr create` URL like
/// `https://github.com/acme/repo/pull/42`.
fn parse_pr_number(url: &str) -> Option<u64> {
    url.rsplit('/').next()?.trim().parse().ok()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrViewFull {
    merged: bool,
    #[serde(default)]
    merged_at: Option<String>,
    base_ref_name: String,
    head_ref_name: String,
    #[serde(default)]
    merge_commit: Option<MergeCommit>,
    #[serde(default)]
    status_check_rollup: Vec<StatusCheck>,
}

#[derive(Debug, Deserialize)]
struct MergeCommit {
    oid: String,
}

#[derive(Debug, Deserialize)]
struct StatusCheck {
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl StatusCheck {
    fn passed(&self) -> bool {
        let verdict = self
            .conclusion
            .as_deref()
            .or(self.state.as_deref())
            .unwrap_or("");
        matches!(verdict, "SUCCESS" | "NEUTRAL" | "SKIPPED")
    }
}

fn parse_pr_details(json: &str) -> Result<PrDetails> {
    let view: PrViewFull = serde_json::from_str(json).context("unexpected JSON from gh pr view")?;
    Ok(PrDetails {
        query_succeeded: true,
        merged: view.merged,
        base_ref_name: view.base_ref_name,
        head_ref_name: view.head_ref_name,
        merged_at: view.merged_at,
        merge_commit_oid: view.merge_commit.map(|c| c.oid),
        checks_passed: view.status_check_rollup.iter().all(StatusCheck::passed),
        error: None,
    })
}
