//! Content-level quality validators for phase artifacts.
//!
//! Each validator is a pure function from document content to a result
//! carrying `valid`, the error messages to feed back into the next agent
//! attempt, and the measurements the decision was based on. Thresholds are
//! deliberately mechanical; the goal is to reject obviously thin output, not
//! to judge prose.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::item::{Prd, StoryStatus, UserStory};

/// Minimum character length for the research summary section.
pub const MIN_SUMMARY_LEN: usize = 200;
/// Minimum character length for the research analysis section.
pub const MIN_ANALYSIS_LEN: usize = 400;
/// Minimum number of citations in a research document.
pub const MIN_CITATIONS: usize = 3;

static HEADING_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.*)$").unwrap());

static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://[^\s)\]>`]+").unwrap());

static MD_LINK_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\]]+\]\([^)]+\)").unwrap());

// Backticked tokens that look like file paths: contain a slash or a dot
// followed by a short extension.
static PATH_REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`\s]*(?:/[^`\s]+|\.[a-zA-Z]{1,5})`").unwrap());

static PHASE_HEADING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^(?:#{1,6}\s+)?(?:phase|step|milestone)\s+(\d+)\b").unwrap()
});

/// Result of validating a research document.
#[derive(Debug, Clone)]
pub struct ResearchValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub citations_count: usize,
    pub summary_len: usize,
    pub analysis_len: usize,
}

/// Result of validating a plan document.
#[derive(Debug, Clone)]
pub struct PlanValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub phase_count: usize,
}

/// Result of validating the stories of a PRD.
#[derive(Debug, Clone)]
pub struct StoryValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub story_count: usize,
    pub failed_story_count: usize,
}

/// Result of checking an agent's "story complete" claim against the
/// progress log. Advisory only: errors are logged, never blocking.
#[derive(Debug, Clone, Default)]
pub struct StoryCompletionVerification {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Extract the body text of the first section whose heading contains
/// `keyword` (case-insensitive). The section runs until the next heading of
/// the same or higher level.
fn section_body<'a>(content: &'a str, keyword: &str) -> Option<&'a str> {
    let keyword = keyword.to_lowercase();
    let headings: Vec<(usize, usize, usize)> = HEADING_REGEX
        .captures_iter(content)
        .map(|cap| {
            let whole = cap.get(0).unwrap();
            let level = cap.get(1).unwrap().as_str().len();
            (whole.start(), whole.end(), level)
        })
        .collect();

    for (idx, cap) in HEADING_REGEX.captures_iter(content).enumerate() {
        let title = cap.get(2).unwrap().as_str().to_lowercase();
        if !title.contains(&keyword) {
            continue;
        }
        let (_, body_start, level) = headings[idx];
        let body_end = headings[idx + 1..]
            .iter()
            .find(|(_, _, l)| *l <= level)
            .map(|(s, _, _)| *s)
            .unwrap_or(content.len());
        return Some(content[body_start..body_end].trim());
    }
    None
}

/// Count citations: URLs, markdown links, and backticked path references.
fn count_citations(content: &str) -> usize {
    URL_REGEX.find_iter(content).count()
        + MD_LINK_REGEX.find_iter(content).count()
        + PATH_REF_REGEX.find_iter(content).count()
}

/// Validate a research document: summary and analysis sections of
/// sufficient length, plus a minimum citation count.
pub fn validate_research(content: &str) -> ResearchValidation {
    let mut errors = Vec::new();

    let summary_len = section_body(content, "summary").map(|s| s.len()).unwrap_or(0);
    let analysis_len = section_body(content, "analysis").map(|s| s.len()).unwrap_or(0);
    let citations_count = count_citations(content);

    if summary_len == 0 {
        errors.push("research.md is missing a Summary section".to_string());
    } else if summary_len < MIN_SUMMARY_LEN {
        errors.push(format!(
            "Summary section is too short ({} chars, need at least {})",
            summary_len, MIN_SUMMARY_LEN
        ));
    }

    if analysis_len == 0 {
        errors.push("research.md is missing an Analysis section".to_string());
    } else if analysis_len < MIN_ANALYSIS_LEN {
        errors.push(format!(
            "Analysis section is too short ({} chars, need at least {})",
            analysis_len, MIN_ANALYSIS_LEN
        ));
    }

    if citations_count < MIN_CITATIONS {
        errors.push(format!(
            "Too few citations ({} found, need at least {}); cite files, URLs, or prior art",
            citations_count, MIN_CITATIONS
        ));
    }

    ResearchValidation {
        valid: errors.is_empty(),
        errors,
        citations_count,
        summary_len,
        analysis_len,
    }
}

/// Validate a plan document: at least one distinct implementation-phase
/// heading (`Phase N`, `Step N`, or `Milestone N`).
pub fn validate_plan(content: &str) -> PlanValidation {
    let distinct: HashSet<&str> = PHASE_HEADING_REGEX
        .captures_iter(content)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect();
    let phase_count = distinct.len();

    let mut errors = Vec::new();
    if phase_count == 0 {
        errors.push(
            "plan.md has no implementation-phase headings (expected at least one 'Phase N' section)"
                .to_string(),
        );
    }

    PlanValidation {
        valid: errors.is_empty(),
        errors,
        phase_count,
    }
}

/// Validate the stories of an agent-submitted PRD. Out-of-range priorities
/// are REJECTED here (the disk loader clamps instead); empty acceptance
/// criteria and stories already marked failed are rejected too.
pub fn validate_stories(prd: &Prd) -> StoryValidation {
    let mut errors = Vec::new();
    let mut failed_story_count = 0;

    for story in &prd.user_stories {
        if story.acceptance_criteria.is_empty()
            || story.acceptance_criteria.iter().all(|c| c.trim().is_empty())
        {
            errors.push(format!("story {} has no acceptance criteria", story.id));
        }
        if story.priority < 1 || story.priority > 4 {
            errors.push(format!(
                "story {} has priority {} outside the allowed range 1-4",
                story.id, story.priority
            ));
        }
        if story.status == StoryStatus::Failed {
            failed_story_count += 1;
            errors.push(format!(
                "story {} is marked failed at creation time",
                story.id
            ));
        }
    }

    StoryValidation {
        valid: errors.is_empty(),
        errors,
        story_count: prd.user_stories.len(),
        failed_story_count,
    }
}

/// Words shorter than this carry no evidential weight when matching
/// acceptance criteria against the progress log.
const MIN_EVIDENCE_WORD_LEN: usize = 4;

/// Check a "story complete" claim against the progress log. Emits warnings
/// for missing evidence; never blocks the status update.
pub fn verify_story_completion(story: &UserStory, progress_log: &str) -> StoryCompletionVerification {
    let mut verification = StoryCompletionVerification::default();

    if story.acceptance_criteria.is_empty() {
        verification
            .errors
            .push(format!("story {} has no acceptance criteria to verify", story.id));
        return verification;
    }

    let log_lower = progress_log.to_lowercase();
    if !log_lower.contains(&story.id.to_lowercase()) {
        verification.warnings.push(format!(
            "progress log has no entry mentioning {}",
            story.id
        ));
    }

    for criterion in &story.acceptance_criteria {
        let has_evidence = criterion
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() >= MIN_EVIDENCE_WORD_LEN)
            .any(|w| log_lower.contains(w));
        if !has_evidence {
            verification.warnings.push(format!(
                "no progress-log evidence for criterion '{}' of {}",
                criterion, story.id
            ));
        }
    }

    verification
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::PRD_SCHEMA_VERSION;

    fn research_doc(summary: &str, analysis: &str, citations: &str) -> String {
        format!(
            "# Research\n\n## Summary\n\n{}\n\n## Analysis\n\n{}\n\n## References\n\n{}\n",
            summary, analysis, citations
        )
    }

    fn long_text(n: usize) -> String {
        "word ".repeat(n / 5 + 1)
    }

    // =========================================
    // Research validator
    // =========================================

    #[test]
    fn test_research_valid_document() {
        let doc = research_doc(
            &long_text(300),
            &long_text(500),
            "- [docs](https://example.com/docs)\n- `src/auth/mod.rs`\n- https://example.com/rfc\n",
        );
        let result = validate_research(&doc);
        assert!(result.valid, "errors: {:?}", result.errors);
        assert!(result.summary_len >= MIN_SUMMARY_LEN);
        assert!(result.analysis_len >= MIN_ANALYSIS_LEN);
        assert!(result.citations_count >= MIN_CITATIONS);
    }

    #[test]
    fn test_research_missing_sections() {
        let result = validate_research("# Research\n\nJust some text with no sections.\n");
        assert!(!result.valid);
        assert_eq!(result.summary_len, 0);
        assert_eq!(result.analysis_len, 0);
        assert!(result.errors.iter().any(|e| e.contains("Summary")));
        assert!(result.errors.iter().any(|e| e.contains("Analysis")));
    }

    #[test]
    fn test_research_short_sections_rejected() {
        let doc = research_doc("too short", "also short", "https://a.com https://b.com `x/y.rs`");
        let result = validate_research(&doc);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("too short")));
    }

    #[test]
    fn test_research_counts_citation_kinds() {
        let doc = research_doc(
            &long_text(300),
            &long_text(500),
            "See https://example.com and [guide](https://example.com/guide) and `src/main.rs`.",
        );
        let result = validate_research(&doc);
        // The markdown link contains a URL, so both patterns match it
        assert!(result.citations_count >= 3);
        assert!(result.valid);
    }

    #[test]
    fn test_research_too_few_citations() {
        let doc = research_doc(&long_text(300), &long_text(500), "no references at all");
        let result = validate_research(&doc);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("citations")));
    }

    #[test]
    fn test_section_body_stops_at_next_heading() {
        let doc = "## Summary\n\nsummary text\n\n## Analysis\n\nanalysis text\n";
        assert_eq!(section_body(doc, "summary"), Some("summary text"));
        assert_eq!(section_body(doc, "analysis"), Some("analysis text"));
    }

    #[test]
    fn test_section_body_keeps_subsections() {
        let doc = "## Analysis\n\nintro\n\n### Detail\n\nmore\n\n## Next\n\nother\n";
        let body = section_body(doc, "analysis").unwrap();
        assert!(body.contains("intro"));
        assert!(body.contains("more"));
        assert!(!body.contains("other"));
    }

    // =========================================
    // Plan validator
    // =========================================

    #[test]
    fn test_plan_with_phase_headings() {
        let doc = "# Plan\n\n## Phase 1: Scaffolding\n\n...\n\n## Phase 2: Logic\n\n...\n";
        let result = validate_plan(doc);
        assert!(result.valid);
        assert_eq!(result.phase_count, 2);
    }

    #[test]
    fn test_plan_counts_distinct_phases_only() {
        let doc = "## Phase 1: A\n\ntext\n\nPhase 1 continues below\n";
        let result = validate_plan(doc);
        assert_eq!(result.phase_count, 1);
    }

    #[test]
    fn test_plan_accepts_step_and_milestone() {
        assert!(validate_plan("## Step 1: Do the thing\n").valid);
        assert!(validate_plan("### Milestone 2 cleanup\n").valid);
    }

    #[test]
    fn test_plan_without_phases_rejected() {
        let result = validate_plan("# Plan\n\nJust prose, no phases.\n");
        assert!(!result.valid);
        assert_eq!(result.phase_count, 0);
        assert!(!result.errors.is_empty());
    }

    // =========================================
    // Story validator
    // =========================================

    fn story(id: &str, priority: u8, status: StoryStatus, criteria: Vec<&str>) -> UserStory {
        UserStory {
            id: id.to_string(),
            title: "T".to_string(),
            acceptance_criteria: criteria.into_iter().map(String::from).collect(),
            priority,
            status,
            notes: String::new(),
        }
    }

    fn prd_of(stories: Vec<UserStory>) -> Prd {
        Prd {
            schema_version: PRD_SCHEMA_VERSION,
            id: "demo".to_string(),
            branch_name: "wreckit/demo".to_string(),
            user_stories: stories,
        }
    }

    #[test]
    fn test_stories_valid() {
        let prd = prd_of(vec![
            story("US-1", 1, StoryStatus::Pending, vec!["criterion one"]),
            story("US-2", 4, StoryStatus::Pending, vec!["criterion two"]),
        ]);
        let result = validate_stories(&prd);
        assert!(result.valid);
        assert_eq!(result.story_count, 2);
        assert_eq!(result.failed_story_count, 0);
    }

    #[test]
    fn test_stories_out_of_range_priority_rejected() {
        let prd = prd_of(vec![story("US-1", 10, StoryStatus::Pending, vec!["c"])]);
        let result = validate_stories(&prd);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("priority 10")));
    }

    #[test]
    fn test_stories_empty_criteria_rejected() {
        let prd = prd_of(vec![
            story("US-1", 1, StoryStatus::Pending, vec![]),
            story("US-2", 1, StoryStatus::Pending, vec!["  "]),
        ]);
        let result = validate_stories(&prd);
        assert!(!result.valid);
        assert_eq!(
            result
                .errors
                .iter()
                .filter(|e| e.contains("no acceptance criteria"))
                .count(),
            2
        );
    }

    #[test]
    fn test_stories_failed_at_creation_rejected() {
        let prd = prd_of(vec![story("US-1", 1, StoryStatus::Failed, vec!["c"])]);
        let result = validate_stories(&prd);
        assert!(!result.valid);
        assert_eq!(result.failed_story_count, 1);
    }

    // =========================================
    // Story completion verifier
    // =========================================

    #[test]
    fn test_completion_with_evidence_is_clean() {
        let s = story(
            "US-1",
            1,
            StoryStatus::Done,
            vec!["login endpoint returns a session token"],
        );
        let log = "[2026-01-01T00:00:00Z] US-1: implemented login endpoint, session token issued\n";
        let v = verify_story_completion(&s, log);
        assert!(v.warnings.is_empty(), "warnings: {:?}", v.warnings);
        assert!(v.errors.is_empty());
    }

    #[test]
    fn test_completion_without_mention_warns() {
        let s = story("US-7", 1, StoryStatus::Done, vec!["renders the dashboard"]);
        let v = verify_story_completion(&s, "[ts] unrelated work on other things\n");
        assert!(v.warnings.iter().any(|w| w.contains("US-7")));
        assert!(v.warnings.iter().any(|w| w.contains("dashboard")));
        // Advisory only
        assert!(v.errors.is_empty());
    }

    #[test]
    fn test_completion_no_criteria_is_an_error() {
        let s = story("US-1", 1, StoryStatus::Done, vec![]);
        let v = verify_story_completion(&s, "");
        assert_eq!(v.errors.len(), 1);
    }
}
