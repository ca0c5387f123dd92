//! Message and content block domain types.
//!
//! Content blocks are persisted as `{"kind": ..., "payload": ...}` JSON. The
//! kind names are the on-disk format and must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Usage;
use crate::session::FunctionCallRecord;
use crate::task::TaskId;

/// Tool name the model uses to request a sandboxed script run.
pub const CODE_INTERPRETER_TOOL: &str = "run_script";

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    /// The end user
    User,
    /// The model
    Assistant,
    /// The runtime: tool results, cancellation notices
    System,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One typed piece of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum ContentBlock {
    Text(String),

    NativeToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    NativeToolResult {
        call_id: String,
        name: String,
        #[serde(default)]
        output: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    CodeInterpreterCall { id: String, script: String },

    CodeInterpreterResult {
        call_id: String,
        #[serde(default)]
        output: serde_json::Value,
        #[serde(default)]
        console: String,
        #[serde(default)]
        function_calls: Vec<FunctionCallRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Classify a model tool request by name.
    ///
    /// `run_script` becomes a code-interpreter call; everything else is a
    /// native tool call.
    pub fn tool_call(id: impl Into<String>, name: &str, input: serde_json::Value) -> Self {
        if name == CODE_INTERPRETER_TOOL {
            let script = match &input {
                serde_json::Value::String(s) => s.clone(),
                other => other
                    .get("script")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            };
            return Self::CodeInterpreterCall {
                id: id.into(),
                script,
            };
        }
        Self::NativeToolCall {
            id: id.into(),
            name: name.to_string(),
            input,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::NativeToolCall { .. } => "native-tool-call",
            Self::NativeToolResult { .. } => "native-tool-result",
            Self::CodeInterpreterCall { .. } => "code-interpreter-call",
            Self::CodeInterpreterResult { .. } => "code-interpreter-result",
        }
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(
            self,
            Self::NativeToolCall { .. } | Self::CodeInterpreterCall { .. }
        )
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(
            self,
            Self::NativeToolResult { .. } | Self::CodeInterpreterResult { .. }
        )
    }

    /// The call as the model originally issued it: `(id, name, input)`.
    pub fn as_tool_use(&self) -> Option<(&str, &str, serde_json::Value)> {
        match self {
            Self::NativeToolCall { id, name, input } => {
                Some((id.as_str(), name.as_str(), input.clone()))
            }
            Self::CodeInterpreterCall { id, script } => Some((
                id.as_str(),
                CODE_INTERPRETER_TOOL,
                serde_json::json!({ "script": script }),
            )),
            _ => None,
        }
    }

    /// The result as fed back to the model: `(call_id, text, is_error)`.
    pub fn as_tool_result(&self) -> Option<(&str, String, bool)> {
        match self {
            Self::NativeToolResult {
                call_id,
                output,
                error,
                ..
            } => {
                let text = match error {
                    Some(e) => format!("Error: {e}"),
                    None => render_value(output),
                };
                Some((call_id.as_str(), text, error.is_some()))
            }
            Self::CodeInterpreterResult {
                call_id,
                output,
                console,
                error,
                ..
            } => {
                let mut text = String::new();
                if !console.is_empty() {
                    text.push_str("Console:\n");
                    text.push_str(console);
                    if !console.ends_with('\n') {
                        text.push('\n');
                    }
                }
                match error {
                    Some(e) => {
                        text.push_str("Error: ");
                        text.push_str(e);
                    }
                    None => {
                        text.push_str("Result: ");
                        text.push_str(&render_value(output));
                    }
                }
                Some((call_id.as_str(), text, error.is_some()))
            }
            _ => None,
        }
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A single turn in a task's conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    pub task_id: TaskId,

    pub source: MessageSource,

    /// Ordered content blocks
    pub content: Vec<ContentBlock>,

    /// Token usage of the model call that produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Cost of that call in dollars
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,

    /// Model that produced the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// True for an assistant reply that requests no tools
    #[serde(default)]
    pub is_final_response: bool,

    /// When the reconciler consumed this message; `None` means pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(task_id: TaskId, source: MessageSource, content: Vec<ContentBlock>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            source,
            content,
            usage: None,
            cost: None,
            model: None,
            is_final_response: false,
            processed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(task_id: TaskId, text: impl Into<String>) -> Self {
        Self::new(task_id, MessageSource::User, vec![ContentBlock::text(text)])
    }

    /// Create a new assistant message.
    pub fn assistant(task_id: TaskId, content: Vec<ContentBlock>) -> Self {
        Self::new(task_id, MessageSource::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(task_id: TaskId, content: Vec<ContentBlock>) -> Self {
        Self::new(task_id, MessageSource::System, content)
    }

    pub fn processed(mut self) -> Self {
        self.processed_at = Some(Utc::now());
        self
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_call)
    }

    /// All text blocks joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user(TaskId::from("t1"), "Hello, agent!");
        assert_eq!(msg.source, MessageSource::User);
        assert_eq!(msg.text(), "Hello, agent!");
        assert!(!msg.has_tool_calls());
        assert!(!msg.is_processed());
    }

    #[test]
    fn content_blocks_use_tagged_format() {
        let block = ContentBlock::text("hi");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "text", "payload": "hi"}));

        let call = ContentBlock::CodeInterpreterCall {
            id: "c1".into(),
            script: "1 + 1".into(),
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["kind"], "code-interpreter-call");
        assert_eq!(json["payload"]["script"], "1 + 1");
    }

    #[test]
    fn persisted_result_block_parses() {
        let raw = r#"{"kind":"native-tool-result","payload":{"call_id":"c9","name":"shell","output":"ok"}}"#;
        let block: ContentBlock = serde_json::from_str(raw).unwrap();
        assert_eq!(block.kind(), "native-tool-result");
        let (id, text, is_error) = block.as_tool_result().unwrap();
        assert_eq!(id, "c9");
        assert_eq!(text, "ok");
        assert!(!is_error);
    }

    #[test]
    fn run_script_is_classified_as_interpreter_call() {
        let block = ContentBlock::tool_call(
            "c1",
            CODE_INTERPRETER_TOOL,
            serde_json::json!({"script": "print(1)"}),
        );
        assert_eq!(
            block,
            ContentBlock::CodeInterpreterCall {
                id: "c1".into(),
                script: "print(1)".into()
            }
        );

        let native = ContentBlock::tool_call("c2", "shell", serde_json::json!({"command": "ls"}));
        assert_eq!(native.kind(), "native-tool-call");
        let (_, name, input) = native.as_tool_use().unwrap();
        assert_eq!(name, "shell");
        assert_eq!(input["command"], "ls");
    }

    #[test]
    fn interpreter_result_renders_console_and_error() {
        let block = ContentBlock::CodeInterpreterResult {
            call_id: "c1".into(),
            output: serde_json::Value::Null,
            console: "step 1".into(),
            function_calls: vec![],
            error: Some("execution was cancelled".into()),
        };
        let (_, text, is_error) = block.as_tool_result().unwrap();
        assert!(is_error);
        assert!(text.contains("step 1"));
        assert!(text.ends_with("Error: execution was cancelled"));
    }

    #[test]
    fn tool_calls_are_detected() {
        let msg = Message::assistant(
            TaskId::from("t1"),
            vec![
                ContentBlock::text("Let me check."),
                ContentBlock::tool_call("c1", "list_dir", serde_json::json!({})),
            ],
        );
        assert!(msg.has_tool_calls());
        assert_eq!(msg.text(), "Let me check.");
    }
}
