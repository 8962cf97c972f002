//! Line-delimited JSON stream protocol emitted by the code generator
//! (`--output-format stream-json`).

pub mod parser;

use serde::Deserialize;
use serde_json::Value;

pub use parser::{ParseSummary, StreamParser};

/// One frame of generator output, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "result")]
    Result(ResultFrame),

    /// `user` frames (tool results) and anything newer than this decoder.
    #[serde(other)]
    Other,
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
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// The terminal `result` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultFrame {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub duration_ms: f64,
}

/// Final outcome of a Run as reported by the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub is_error: bool,
    pub text: String,
    pub num_turns: u32,
    pub total_cost_usd: f64,
    pub duration_ms: f64,
    pub session_id: Option<String>,
}

impl From<ResultFrame> for RunResult {
    fn from(frame: ResultFrame) -> Self {
        Self {
            is_error: frame.is_error,
            text: frame.result.unwrap_or_default(),
            num_turns: frame.num_turns,
            total_cost_usd: frame.total_cost_usd,
            duration_ms: frame.duration_ms,
            session_id: frame.session_id,
        }
    }
}

/// A normalized unit of incremental output.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Text(String),
    ToolUse { name: String, summary: String },
    Completed(RunResult),
}

/// One-line summary of a tool invocation. Unknown tools fall back to the raw name.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    let summary = match name {
        "Read" => field("file_path").map(|p| format!("Read {}", shorten_path(p))),
        "Edit" | "MultiEdit" => field("file_path").map(|p| format!("Edited {}", shorten_path(p))),
        "Write" => field("file_path").map(|p| format!("Created {}", shorten_path(p))),
        "Bash" => field("command").map(|c| format!("`{}`", truncate_str(c, 60))),
        "Glob" => field("pattern").map(|p| format!("Searched {}", p)),
        "Grep" => field("pattern").map(|p| format!("Searched `{}`", truncate_str(p, 40))),
        "Task" => field("description").map(|d| format!("Agent: {}", d)),
        _ => None,
    };
    summary.unwrap_or_else(|| name.to_string())
}

/// Shorten a file path to `.../` plus its last 2 components.
pub fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        format!(".../{}", parts[parts.len() - 2..].join("/"))
    }
}

/// Truncate to `max_chars` characters, appending an ellipsis when cut.
fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assistant_tool_use() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/foo/bar.rs"},"id":"123"}]},"session_id":"abc"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();

        if let StreamEvent::Assistant { message, session_id } = event {
            assert_eq!(session_id.as_deref(), Some("abc"));
            assert_eq!(message.content.len(), 1);
            if let ContentBlock::ToolUse { name, input, .. } = &message.content[0] {
                assert_eq!(name, "Read");
                assert_eq!(
                    input.get("file_path").unwrap().as_str().unwrap(),
                    "/foo/bar.rs"
                );
            } else {
                panic!("Expected ToolUse");
            }
        } else {
            panic!("Expected Assistant event");
        }
    }

    #[test]
    fn test_parse_system_init() {
        let json = r#"{"type":"system","subtype":"init","session_id":"sess-42","tools":[]}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        match event {
            StreamEvent::System {
                subtype,
                session_id,
            } => {
                assert_eq!(subtype, "init");
                assert_eq!(session_id.as_deref(), Some("sess-42"));
            }
            _ => panic!("Expected System event"),
        }
    }

    #[test]
    fn test_parse_result_frame() {
        let json = r#"{"type":"result","subtype":"success","is_error":false,"result":"Done","num_turns":3,"total_cost_usd":0.02,"duration_ms":4200,"session_id":"sess-42"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        let StreamEvent::Result(frame) = event else {
            panic!("Expected Result event");
        };
        let result = RunResult::from(frame);
        assert!(!result.is_error);
        assert_eq!(result.text, "Done");
        assert_eq!(result.num_turns, 3);
        assert!((result.total_cost_usd - 0.02).abs() < f64::EPSILON);
        assert_eq!(result.session_id.as_deref(), Some("sess-42"));
    }

    #[test]
    fn test_unknown_frame_and_block_types_decode_as_other() {
        let json = r#"{"type":"user","message":{"content":[]}}"#;
        assert!(matches!(
            serde_json::from_str::<StreamEvent>(json).unwrap(),
            StreamEvent::Other
        ));

        let json = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"}]}}"#;
        let StreamEvent::Assistant { message, .. } = serde_json::from_str(json).unwrap() else {
            panic!("Expected Assistant event");
        };
        assert!(matches!(message.content[0], ContentBlock::Other));
    }

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"file_path": "/Users/foo/project/src/main.rs"});
        assert_eq!(describe_tool_use("Read", &input), "Read .../src/main.rs");
        assert_eq!(describe_tool_use("Edit", &input), "Edited .../src/main.rs");
        assert_eq!(describe_tool_use("Write", &input), "Created .../src/main.rs");

        let input = serde_json::json!({"command": "cargo test --release"});
        assert_eq!(describe_tool_use("Bash", &input), "`cargo test --release`");

        let input = serde_json::json!({"pattern": "**/*.rs"});
        assert_eq!(describe_tool_use("Glob", &input), "Searched **/*.rs");
        assert_eq!(describe_tool_use("Grep", &input), "Searched `**/*.rs`");
    }

    #[test]
    fn test_describe_unknown_tool_falls_back_to_name() {
        let input = serde_json::json!({"url": "https://example.com"});
        assert_eq!(describe_tool_use("WebFetch", &input), "WebFetch");
        // Known tool with missing input also falls back.
        assert_eq!(describe_tool_use("Read", &Value::Null), "Read");
    }

    #[test]
    fn test_long_bash_command_is_truncated() {
        let cmd = "x".repeat(100);
        let input = serde_json::json!({ "command": cmd });
        let summary = describe_tool_use("Bash", &input);
        assert_eq!(summary, format!("`{}...`", "x".repeat(60)));
    }

    #[test]
    fn test_shorten_path() {
        assert_eq!(shorten_path("main.rs"), "main.rs");
        assert_eq!(shorten_path("src/main.rs"), "src/main.rs");
        assert_eq!(shorten_path("/a/b/c/d.rs"), ".../c/d.rs");
    }

    #[test]
    fn test_truncate_str_is_char_safe() {
        assert_eq!(truncate_str("日本語テキスト", 3), "日本語...");
        assert_eq!(truncate_str("short", 10), "short");
    }
}
