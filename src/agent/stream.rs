//! Stream-event parsing for the agent CLI's `stream-json` output format.

use serde::Deserialize;
use serde_json::Value;

/// Events emitted on the agent's stdout, one JSON object per line.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System { subtype: String },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },
}

/// One-line human description of a tool use, for the observer stream.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string()
    };
    match name {
        "Read" => format!("read {}", path("file_path")),
        "Write" => format!("write {}", path("file_path")),
        "Edit" => format!("edit {}", path("file_path")),
        "Bash" => format!("run {}", crate::util::truncate_str(&path("command"), 60)),
        "Glob" => format!("glob {}", path("pattern")),
        "Grep" => format!("grep {}", crate::util::truncate_str(&path("pattern"), 40)),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_text_block() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::Assistant { message } => match &message.content[0] {
                ContentBlock::Text { text } => assert_eq!(text, "working on it"),
                other => panic!("expected text block, got {:?}", other),
            },
            other => panic!("expected assistant event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tool_use_block() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"research.md"}}]}}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::Assistant { message } => match &message.content[0] {
                ContentBlock::ToolUse { name, input } => {
                    assert_eq!(name, "Write");
                    assert_eq!(describe_tool_use(name, input), "write research.md");
                }
                other => panic!("expected tool_use block, got {:?}", other),
            },
            other => panic!("expected assistant event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_event() {
        let json = r#"{"type":"result","subtype":"success","result":"all done","is_error":false}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::Result { result, is_error } => {
                assert_eq!(result.as_deref(), Some("all done"));
                assert!(!is_error);
            }
            other => panic!("expected result event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_system_event() {
        let json = r#"{"type":"system","subtype":"init"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, StreamEvent::System { .. }));
    }

    #[test]
    fn test_describe_unknown_tool_falls_back_to_name() {
        assert_eq!(
            describe_tool_use("WebSearch", &serde_json::json!({})),
            "WebSearch"
        );
    }
}
