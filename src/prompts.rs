//! Prompt template store and renderer.
//!
//! Each phase has a markdown template with `{{variable}}` placeholders.
//! Templates are read from `.wreckit/prompts/<phase>.md` when present and
//! fall back to the embedded defaults below, so a fresh project works
//! without any setup while operators can override any phase's prompt.
//! Rendering fails loudly on placeholders the caller did not supply.

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([a-z_]+)\}\}").unwrap());

const DEFAULT_RESEARCH_PROMPT: &str = r#"# Research: {{title}}

You are researching a work item before any implementation begins.

## Item

- id: {{item_id}}
- title: {{title}}

## Overview

{{overview}}

## Task

Investigate the codebase and any relevant prior art, then write your findings
to `{{research_path}}`. The document must contain:

1. A `## Summary` section: what the item is about and the recommended direction.
2. A `## Analysis` section: the relevant code paths, constraints, and trade-offs.
3. At least three citations: file paths in backticks, URLs, or markdown links.

Write ONLY to `{{research_path}}`. Do not modify any other file.
"#;

const DEFAULT_PLAN_PROMPT: &str = r#"# Plan: {{title}}

You are planning the implementation of a researched work item.

## Item

- id: {{item_id}}
- title: {{title}}

## Overview

{{overview}}

## Research

{{research}}

## Task

1. Write an implementation plan to `{{plan_path}}` with one `## Phase N:` heading
   per implementation phase.
2. Submit a PRD by POSTing JSON to the tool endpoint
   `{{tool_server_url}}/tool/save_prd` with this shape:

```json
{
  "schema_version": 1,
  "id": "{{item_id}}",
  "branch_name": "{{branch_name}}",
  "user_stories": [
    {
      "id": "US-1",
      "title": "...",
      "acceptance_criteria": ["..."],
      "priority": 1,
      "status": "pending",
      "notes": ""
    }
  ]
}
```

Story priorities run 1 (highest) to 4 (lowest). Every story needs at least
one acceptance criterion. Write ONLY to `{{plan_path}}`; the PRD goes through
the tool endpoint, not the filesystem.
"#;

const DEFAULT_IMPLEMENT_PROMPT: &str = r#"# Implement: {{title}}

You are implementing one user story of a planned work item.

## Item

- id: {{item_id}}
- title: {{title}}

## Current story

{{story}}

## PRD

{{prd}}

## Plan

{{plan}}

## Research

{{research}}

## Progress so far

{{progress}}

## Task

Implement the current story completely, including tests. When the story's
acceptance criteria are met and verified, report it by POSTing JSON to
`{{tool_server_url}}/tool/update_story_status`:

```json
{ "story_id": "{{story_id}}", "status": "done", "verification": "what you verified and how" }
```

Report `"status": "failed"` instead if the story cannot be completed, and say
why in `verification`.
"#;

const DEFAULT_CRITIQUE_PROMPT: &str = r#"# Critique: {{title}}

You are reviewing a finished implementation before it may proceed to a pull
request. Read the plan and PRD below, inspect the code, and run the test
suite.

## Item

- id: {{item_id}}
- title: {{title}}

## Plan

{{plan}}

## PRD

{{prd}}

## Verdict

After your review, output your verdict as the LAST thing you print, as a
fenced JSON block:

```json
{
  "status": "approved",
  "reason": "one-line justification",
  "critique": "full review notes"
}
```

Use `"status": "rejected"` when the implementation does not satisfy the plan
or the stories' acceptance criteria.
"#;

const DEFAULT_PR_PROMPT: &str = r#"# Pull request description: {{title}}

Gather the diff between `{{base_branch}}` and the current branch and write a
pull-request title and body for it.

## Item

- id: {{item_id}}
- title: {{title}}

## Overview

{{overview}}

## Output

Print the description between the literal markers below, as JSON with `title`
and `body` fields:

PR_JSON_START
{"title": "...", "body": "..."}
PR_JSON_END
"#;

/// Loads per-phase templates with embedded fallbacks and renders
/// `{{variable}}` placeholders.
#[derive(Debug, Clone)]
pub struct PromptStore {
    prompts_dir: PathBuf,
}

impl PromptStore {
    pub fn new(prompts_dir: PathBuf) -> Self {
        Self { prompts_dir }
    }

    fn default_template(name: &str) -> Option<&'static str> {
        match name {
            "research" => Some(DEFAULT_RESEARCH_PROMPT),
            "plan" => Some(DEFAULT_PLAN_PROMPT),
            "implement" => Some(DEFAULT_IMPLEMENT_PROMPT),
            "critique" => Some(DEFAULT_CRITIQUE_PROMPT),
            "pr" => Some(DEFAULT_PR_PROMPT),
            _ => None,
        }
    }

    /// Raw template text: the override file if present, else the default.
    pub fn template(&self, name: &str) -> Result<String> {
        let path = self.prompts_dir.join(format!("{}.md", name));
        if path.exists() {
            return std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt template: {}", path.display()));
        }
        Self::default_template(name)
            .map(String::from)
            .ok_or_else(|| anyhow!("No prompt template named '{}'", name))
    }

    /// Render a template, substituting every `{{variable}}`. Unresolved
    /// placeholders are an error so a typo'd template fails before the
    /// agent ever runs.
    pub fn render(&self, name: &str, vars: &HashMap<&str, String>) -> Result<String> {
        let template = self.template(name)?;
        let mut unresolved = Vec::new();
        let rendered = PLACEHOLDER_REGEX.replace_all(&template, |caps: &regex::Captures| {
            let key = caps.get(1).unwrap().as_str();
            match vars.get(key) {
                Some(value) => value.clone(),
                None => {
                    unresolved.push(key.to_string());
                    String::new()
                }
            }
        });
        if !unresolved.is_empty() {
            unresolved.sort();
            unresolved.dedup();
            return Err(anyhow!(
                "Prompt template '{}' has unresolved placeholders: {}",
                name,
                unresolved.join(", ")
            ));
        }
        Ok(rendered.into_owned())
    }
}

/// Preamble prepended to a retry prompt carrying the previous attempt's
/// validation errors.
pub fn feedback_preamble(errors: &[String]) -> String {
    let mut out = String::from(
        "## CRITICAL: previous attempt failed\n\nYour previous attempt was rejected:\n\n",
    );
    for error in errors {
        out.push_str(&format!("- {}\n", error));
    }
    out.push_str("\nFix every issue above this time.\n\n");
    out
}
