//! Engine configuration.
//!
//! Settings are read from `.wreckit/config.json` inside the project root and
//! layered over built-in defaults: every field is optional in the file and
//! falls back to a `default_*` function. `Config` bridges the file settings
//! with the runtime paths the engine needs (items directory, prompts
//! directory).
//!
//! ```json
//! {
//!   "base_branch": "main",
//!   "branch_prefix": "wreckit/",
//!   "merge_mode": "pr",
//!   "max_iterations": 10,
//!   "timeout_seconds": 300,
//!   "pr_checks": {
//!     "allow_unsafe_direct_merge": false,
//!     "allowed_remote_patterns": ["git@github.com:acme/*"],
//!     "checks": [
//!       { "name": "tests", "command": "cargo test" }
//!     ]
//!   },
//!   "branch_cleanup": { "enabled": true, "delete_remote": false }
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How the PR phase lands work on the base branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Push the item branch and open a pull request (default)
    #[default]
    Pr,
    /// Merge straight into the base branch; requires explicit opt-in
    Direct,
}

impl std::fmt::Display for MergeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeMode::Pr => write!(f, "pr"),
            MergeMode::Direct => write!(f, "direct"),
        }
    }
}

/// One configured pre-push shell check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityCheck {
    pub name: String,
    /// Shell invocation, run with `sh -c` from the project root
    pub command: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Gates applied before any push or merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrChecks {
    /// Must be true for `merge_mode = direct` to be honored
    #[serde(default)]
    pub allow_unsafe_direct_merge: bool,
    /// Glob patterns the `origin` URL must match; empty list allows any URL
    #[serde(default)]
    pub allowed_remote_patterns: Vec<String>,
    /// Ordered pre-push checks
    #[serde(default)]
    pub checks: Vec<QualityCheck>,
}

impl Default for PrChecks {
    fn default() -> Self {
        Self {
            allow_unsafe_direct_merge: false,
            allowed_remote_patterns: Vec::new(),
            checks: Vec::new(),
        }
    }
}

/// Branch-cleanup behavior after an item completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchCleanup {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub delete_remote: bool,
}

impl Default for BranchCleanup {
    fn default() -> Self {
        Self {
            enabled: true,
            delete_remote: false,
        }
    }
}

/// Agent launch settings, passed through to the agent driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_agent_cmd")]
    pub command: String,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    /// Extra flags appended to every invocation
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_cmd(),
            skip_permissions: true,
            extra_args: Vec::new(),
        }
    }
}

/// Settings file contents (`.wreckit/config.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WreckitConfig {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default)]
    pub merge_mode: MergeMode,
    /// Cap on implement-loop iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Base agent timeout; the critique phase uses a multiple of this
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// When true (default), PR entry requires the item to have passed critique
    #[serde(default = "default_true")]
    pub require_critique: bool,
    #[serde(default)]
    pub pr_checks: PrChecks,
    #[serde(default)]
    pub branch_cleanup: BranchCleanup,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Default for WreckitConfig {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            branch_prefix: default_branch_prefix(),
            merge_mode: MergeMode::default(),
            max_iterations: default_max_iterations(),
            timeout_seconds: default_timeout_seconds(),
            require_critique: true,
            pr_checks: PrChecks::default(),
            branch_cleanup: BranchCleanup::default(),
            agent: AgentConfig::default(),
        }
    }
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "wreckit/".to_string()
}

fn default_max_iterations() -> u32 {
    10
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_agent_cmd() -> String {
    "claude".to_string()
}

fn default_true() -> bool {
    true
}

/// The critique phase gets a longer leash than the base timeout.
pub const CRITIQUE_TIMEOUT_MULTIPLIER: u64 = 3;

/// Runtime configuration: file settings plus resolved paths.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub wreckit_dir: PathBuf,
    pub items_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub settings: WreckitConfig,
    pub verbose: bool,
}

impl Config {
    /// Load configuration for a project, layering `.wreckit/config.json`
    /// over defaults. A missing settings file is not an error.
    pub fn load(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let wreckit_dir = project_dir.join(".wreckit");
        let settings = Self::load_settings(&wreckit_dir.join("config.json"))?;

        Ok(Self {
            items_dir: wreckit_dir.join("items"),
            prompts_dir: wreckit_dir.join("prompts"),
            wreckit_dir,
            project_dir,
            settings,
            verbose,
        })
    }

    fn load_settings(path: &Path) -> Result<WreckitConfig> {
        if !path.exists() {
            return Ok(WreckitConfig::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON: {}", path.display()))
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.items_dir).context("Failed to create items directory")?;
        std::fs::create_dir_all(&self.prompts_dir).context("Failed to create prompts directory")?;
        Ok(())
    }

    /// Directory owning one item's record and artifacts.
    pub fn item_dir(&self, item_id: &str) -> PathBuf {
        self.items_dir.join(item_id)
    }

    /// Agent timeout for a phase, in seconds.
    pub fn timeout_for(&self, phase: crate::orchestrator::Phase) -> u64 {
        match phase {
            crate::orchestrator::Phase::Critique => {
                self.settings.timeout_seconds * CRITIQUE_TIMEOUT_MULTIPLIER
            }
            _ => self.settings.timeout_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_config_file() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.settings.base_branch, "main");
        assert_eq!(config.settings.branch_prefix, "wreckit/");
        assert_eq!(config.settings.merge_mode, MergeMode::Pr);
        assert_eq!(config.settings.max_iterations, 10);
        assert_eq!(config.settings.timeout_seconds, 300);
        assert!(config.settings.require_critique);
        assert!(!config.settings.pr_checks.allow_unsafe_direct_merge);
        assert!(config.settings.branch_cleanup.enabled);
        assert_eq!(config.settings.agent.command, "claude");
    }

    #[test]
    fn test_partial_config_file_layers_over_defaults() {
        let dir = tempdir().unwrap();
        let wreckit = dir.path().join(".wreckit");
        fs::create_dir_all(&wreckit).unwrap();
        fs::write(
            wreckit.join("config.json"),
            r#"{
                "base_branch": "develop",
                "merge_mode": "direct",
                "pr_checks": {
                    "allow_unsafe_direct_merge": true,
                    "checks": [
                        { "name": "tests", "command": "cargo test" },
                        { "name": "lint", "command": "cargo clippy", "enabled": false }
                    ]
                }
            }"#,
        )
        .unwrap();

        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.settings.base_branch, "develop");
        assert_eq!(config.settings.merge_mode, MergeMode::Direct);
        assert!(config.settings.pr_checks.allow_unsafe_direct_merge);
        assert_eq!(config.settings.pr_checks.checks.len(), 2);
        assert!(config.settings.pr_checks.checks[0].enabled);
        assert!(!config.settings.pr_checks.checks[1].enabled);
        // Untouched fields keep defaults
        assert_eq!(config.settings.branch_prefix, "wreckit/");
        assert_eq!(config.settings.max_iterations, 10);
    }

    #[test]
    fn test_invalid_config_json_is_an_error() {
        let dir = tempdir().unwrap();
        let wreckit = dir.path().join(".wreckit");
        fs::create_dir_all(&wreckit).unwrap();
        fs::write(wreckit.join("config.json"), "{ not json }").unwrap();
        let result = Config::load(dir.path().to_path_buf(), false);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse config JSON")
        );
    }

    #[test]
    fn test_item_dir_nests_slug_slashes() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        let item_dir = config.item_dir("auth/login");
        assert!(item_dir.ends_with(".wreckit/items/auth/login"));
    }

    #[test]
    fn test_critique_timeout_multiplier() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.timeout_for(crate::orchestrator::Phase::Research), 300);
        assert_eq!(config.timeout_for(crate::orchestrator::Phase::Critique), 900);
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().to_path_buf(), false).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.items_dir.exists());
        assert!(config.prompts_dir.exists());
    }
}
