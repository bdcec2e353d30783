//! Shared helpers for extracting structured output from agent text.
//!
//! Agents interleave prose with the JSON the engine needs, so extraction is
//! deliberately lenient: prefer the last fenced ```json block, then scan for
//! balanced-brace candidates from the tail of the text, and return the first
//! candidate that deserializes into the expected shape.

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::LazyLock;

static JSON_FENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)```").unwrap());

/// Extract a balanced JSON object starting at byte offset `start`
/// (which must point at a `{`).
fn balanced_object_at(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// All fenced ```json blocks in order of appearance.
pub fn fenced_json_blocks(text: &str) -> Vec<String> {
    JSON_FENCE_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_string()))
        .collect()
}

/// Extract the last JSON value in `text` that deserializes as `T`.
///
/// Strategy: fenced ```json blocks are tried from last to first; if none
/// validates, balanced `{...}` candidates are scanned from the tail of the
/// text and the first (i.e. latest) validating one wins.
pub fn extract_last_json<T: DeserializeOwned>(text: &str) -> Option<T> {
    for block in fenced_json_blocks(text).iter().rev() {
        if let Ok(value) = serde_json::from_str::<T>(block) {
            return Some(value);
        }
    }

    let starts: Vec<usize> = text
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .map(|(i, _)| i)
        .collect();
    for &start in starts.iter().rev() {
        if let Some(candidate) = balanced_object_at(text, start)
            && let Ok(value) = serde_json::from_str::<T>(candidate)
        {
            return Some(value);
        }
    }
    None
}

/// Extract the text between two literal delimiter tokens, trimmed.
/// Used for the `PR_JSON_START` / `PR_JSON_END` description protocol.
pub fn extract_between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let s = text.find(start)? + start.len();
    let e = s + text[s..].find(end)?;
    Some(text[s..e].trim())
}

/// Truncate a string with an ellipsis for log output.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        status: String,
        reason: String,
    }

    #[test]
    fn test_fenced_block_preferred() {
        let text = r#"
Some chatter {"status": "bogus", "reason": "inline"} more chatter.

```json
{"status": "approved", "reason": "looks good"}
```
"#;
        let v: Verdict = extract_last_json(text).unwrap();
        assert_eq!(v.status, "approved");
    }

    #[test]
    fn test_last_fenced_block_wins() {
        let text = r#"
```json
{"status": "rejected", "reason": "first pass"}
```
Revised verdict:
```json
{"status": "approved", "reason": "second pass"}
```
"#;
        let v: Verdict = extract_last_json(text).unwrap();
        assert_eq!(v.reason, "second pass");
    }

    #[test]
    fn test_invalid_fence_falls_back_to_brace_scan() {
        let text = r#"
```json
{ this is not json
```
Final answer: {"status": "approved", "reason": "fallback"}
"#;
        let v: Verdict = extract_last_json(text).unwrap();
        assert_eq!(v.reason, "fallback");
    }

    #[test]
    fn test_brace_scan_picks_latest_validating_candidate() {
        let text = r#"{"status": "rejected", "reason": "old"} ... {"unrelated": true} ... {"status": "approved", "reason": "new"}"#;
        let v: Verdict = extract_last_json(text).unwrap();
        assert_eq!(v.reason, "new");
    }

    #[test]
    fn test_nested_objects_and_strings_with_braces() {
        #[derive(Deserialize)]
        struct Outer {
            inner: serde_json::Value,
        }
        let text = r#"prefix {"inner": {"note": "has } brace in string"}} suffix"#;
        let v: Outer = extract_last_json(text).unwrap();
        assert_eq!(v.inner["note"], "has } brace in string");
    }

    #[test]
    fn test_no_json_returns_none() {
        assert!(extract_last_json::<Verdict>("no json here at all").is_none());
        assert!(extract_last_json::<Verdict>("{ unclosed").is_none());
    }

    #[test]
    fn test_extract_between() {
        let text = "noise PR_JSON_START {\"title\": \"t\"} PR_JSON_END trailing";
        assert_eq!(
            extract_between(text, "PR_JSON_START", "PR_JSON_END"),
            Some("{\"title\": \"t\"}")
        );
        assert!(extract_between(text, "MISSING_START", "PR_JSON_END").is_none());
        assert!(extract_between("PR_JSON_START only", "PR_JSON_START", "PR_JSON_END").is_none());
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a longer string", 10), "a longe...");
    }
}
