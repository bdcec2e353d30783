//! CLI command implementations.
//!
//! The CLI is a thin shell over the engine: it resolves the project
//! directory, wires up the agent driver and the event stream, and maps
//! phase failure onto exit code 1. The engine itself never terminates the
//! process.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::CliAgent;
use crate::config::Config;
use crate::events::WorkflowEvent;
use crate::item::{Item, ItemState, slugify};
use crate::orchestrator::{self, Phase};
use crate::phases::RunnerContext;
use crate::repo::Repository;
use crate::util::truncate_str;

#[derive(Parser)]
#[command(name = "wreckit")]
#[command(version, about = "Autonomous item workflow engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Bypass the from-state check (artifact checks still apply)
    #[arg(long, global = true)]
    pub force: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the .wreckit directory in the current project
    Init,
    /// Create a new work item in the idea state
    New {
        title: String,
        /// Slug id; derived from the title when omitted
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        section: Option<String>,
        #[arg(long)]
        overview: Option<String>,
    },
    /// Drive an item through phases until done or a phase fails
    Run {
        /// Item id; the first non-done item when omitted
        id: Option<String>,
        /// Cap on runner invocations for this call
        #[arg(long, default_value = "12")]
        max_phases: u32,
    },
    /// Run a single phase against an item
    Phase { name: String, id: String },
    /// List all items with their states
    List,
    /// Show one item in detail
    Status { id: String },
    /// Print the effective merged configuration
    Config,
}

/// Dispatch a parsed CLI invocation. Returns false when a phase failed so
/// `main` can exit non-zero.
pub async fn execute(cli: Cli) -> Result<bool> {
    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let config = Config::load(project_dir, cli.verbose)?;

    match &cli.command {
        Commands::Init => cmd_init(&config),
        Commands::New {
            title,
            id,
            section,
            overview,
        } => cmd_new(
            &config,
            title,
            id.as_deref(),
            section.clone(),
            overview.clone(),
        ),
        Commands::Run { id, max_phases } => {
            cmd_run(&config, id.as_deref(), cli.force, *max_phases).await
        }
        Commands::Phase { name, id } => cmd_phase(&config, name, id, cli.force).await,
        Commands::List => cmd_list(&config),
        Commands::Status { id } => cmd_status(&config, id),
        Commands::Config => cmd_config(&config),
    }
}

fn cmd_init(config: &Config) -> Result<bool> {
    config.ensure_directories()?;
    let config_path = config.wreckit_dir.join("config.json");
    if !config_path.exists() {
        let defaults = crate::config::WreckitConfig::default();
        std::fs::write(&config_path, serde_json::to_string_pretty(&defaults)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
    }
    println!(
        "Initialized wreckit project at {}",
        config.wreckit_dir.display()
    );
    Ok(true)
}

fn cmd_new(
    config: &Config,
    title: &str,
    id: Option<&str>,
    section: Option<String>,
    overview: Option<String>,
) -> Result<bool> {
    config.ensure_directories()?;
    let id = match id {
        Some(id) => id.to_string(),
        None => match &section {
            Some(section) => format!("{}/{}", section, slugify(title)),
            None => slugify(title),
        },
    };
    let repo = Repository::new(config.items_dir.clone());
    if repo.item_exists(&id) {
        bail!("Item '{}' already exists", id);
    }
    let mut item = Item::new(&id, title)?;
    item.section = section;
    item.overview = overview.unwrap_or_default();
    repo.save_item(&mut item)?;
    println!("Created item {} ({})", style(&id).green(), item.title);
    Ok(true)
}

/// Spawn the task that renders workflow events as they stream in.
fn spawn_event_printer() -> crate::events::EventSender {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                WorkflowEvent::AgentChunk { text } => {
                    let snippet = truncate_str(text.lines().next().unwrap_or(""), 80);
                    if !snippet.is_empty() {
                        println!("  {}", style(snippet).dim());
                    }
                }
                WorkflowEvent::AgentEvent { name, .. } => {
                    println!("  {} {}", style("tool").cyan(), name);
                }
                WorkflowEvent::PhaseChanged { item_id, state } => {
                    println!(
                        "{} {} -> {}",
                        style("state").green().bold(),
                        item_id,
                        style(state).bold()
                    );
                }
                WorkflowEvent::StoryChanged { story_id, .. } => {
                    if !story_id.is_empty() {
                        println!("  {} {}", style("story").magenta(), story_id);
                    }
                }
                WorkflowEvent::IterationChanged { iteration, max, .. } => {
                    println!("  {} {}/{}", style("iteration").dim(), iteration, max);
                }
            }
        }
    });
    tx
}

fn build_context(config: &Config) -> RunnerContext {
    let agent = Arc::new(CliAgent::new(config.settings.agent.clone()));
    let events = Some(spawn_event_printer());
    RunnerContext::new(config.clone(), agent, events)
}

/// The first item, by id, that still has phases to run.
fn next_actionable_item(repo: &Repository) -> Result<Option<String>> {
    let items = repo.list_items()?;
    Ok(items
        .into_iter()
        .find(|i| i.state != ItemState::Done)
        .map(|i| i.id))
}

async fn cmd_run(config: &Config, id: Option<&str>, force: bool, max_phases: u32) -> Result<bool> {
    let repo = Repository::new(config.items_dir.clone());
    let id = match id {
        Some(id) => id.to_string(),
        None => match next_actionable_item(&repo)? {
            Some(id) => id,
            None => {
                println!("No actionable items");
                return Ok(true);
            }
        },
    };

    let ctx = build_context(config);
    let summary = orchestrator::run_item(&ctx, &id, force, max_phases).await?;

    println!();
    for (phase, success) in &summary.phases_run {
        let marker = if *success {
            style("ok").green()
        } else {
            style("failed").red()
        };
        println!("  {} {}", phase, marker);
    }
    if summary.failed {
        if let Some(error) = &summary.item.last_error {
            println!("{} {}", style("error:").red().bold(), error);
        }
        return Ok(false);
    }
    println!(
        "{} {} is now {}",
        style("done:").green().bold(),
        id,
        summary.item.state
    );
    Ok(true)
}

async fn cmd_phase(config: &Config, name: &str, id: &str, force: bool) -> Result<bool> {
    let phase: Phase = name.parse()?;
    let ctx = build_context(config);
    let result = orchestrator::run_phase(&ctx, phase, id, force).await?;
    if !result.success {
        if let Some(error) = &result.item.last_error {
            println!("{} {}", style("error:").red().bold(), error);
        }
        return Ok(false);
    }
    println!(
        "{} {} is now {}",
        style("ok:").green().bold(),
        id,
        result.item.state
    );
    Ok(true)
}

fn cmd_list(config: &Config) -> Result<bool> {
    let repo = Repository::new(config.items_dir.clone());
    let items = repo.list_items()?;
    if items.is_empty() {
        println!("No items. Create one with 'wreckit new <title>'.");
        return Ok(true);
    }
    for item in items {
        let state = match item.state {
            ItemState::Done => style(item.state.to_string()).green(),
            _ if item.last_error.is_some() => style(item.state.to_string()).red(),
            _ => style(item.state.to_string()).cyan(),
        };
        let error_marker = if item.last_error.is_some() { " !" } else { "" };
        println!("  {:<13} {} - {}{}", state, item.id, item.title, error_marker);
    }
    Ok(true)
}

fn cmd_status(config: &Config, id: &str) -> Result<bool> {
    let repo = Repository::new(config.items_dir.clone());
    let item = repo.load_item(id)?;
    println!("{}", style(&item.title).bold());
    println!("  id:       {}", item.id);
    println!("  state:    {}", item.state);
    if let Some(branch) = &item.branch {
        println!("  branch:   {}", branch);
    }
    if let Some(pr_url) = &item.pr_url {
        println!("  pr:       {}", pr_url);
    }
    if let Some(error) = &item.last_error {
        println!("  {} {}", style("error:").red(), error);
    }
    if let Some(merged_at) = &item.merged_at {
        println!("  merged:   {}", merged_at.to_rfc3339());
    }
    let progress = repo.read_progress(id)?;
    if !progress.is_empty() {
        println!("\nrecent progress:");
        for line in progress.lines().rev().take(5).collect::<Vec<_>>().iter().rev() {
            println!("  {}", style(line).dim());
        }
    }
    Ok(true)
}

fn cmd_config(config: &Config) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(&config.settings)?);
    Ok(true)
}
