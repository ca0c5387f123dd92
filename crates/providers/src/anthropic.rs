//! Anthropic native provider implementation.
//!
//! Uses the Messages API directly:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE with `content_block_delta` events

use async_trait::async_trait;
use serde::Serialize;
use taskforge_core::agent::Model;
use taskforge_core::error::ProviderError;
use taskforge_core::message::{ContentBlock, Message, MessageSource};
use taskforge_core::provider::{
    InvokeOptions, InvokeResponse, ModelProvider, ToolDefinition, Usage, emit_partial,
};
use tracing::{debug, trace};

use crate::sse::{self, SseLine};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .unwrap_or_default();

        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert history to Anthropic messages.
    ///
    /// Tool results travel in user turns, and consecutive turns of the same
    /// role are merged because the API requires alternation.
    fn to_api_messages(history: &[Message]) -> Vec<AnthropicMessage> {
        let mut result: Vec<AnthropicMessage> = Vec::new();

        for msg in history {
            let role = match msg.source {
                MessageSource::Assistant => "assistant",
                MessageSource::User | MessageSource::System => "user",
            };
            let blocks: Vec<ApiBlock> =
                msg.content.iter().filter_map(Self::to_api_block).collect();
            if blocks.is_empty() {
                continue;
            }
            match result.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => result.push(AnthropicMessage {
                    role,
                    content: blocks,
                }),
            }
        }

        result
    }

    fn to_api_block(block: &ContentBlock) -> Option<ApiBlock> {
        if let ContentBlock::Text(text) = block {
            return (!text.is_empty()).then(|| ApiBlock::Text { text: text.clone() });
        }
        if let Some((id, name, input)) = block.as_tool_use() {
            return Some(ApiBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            });
        }
        block
            .as_tool_result()
            .map(|(call_id, content, is_error)| ApiBlock::ToolResult {
                tool_use_id: call_id.to_string(),
                content,
                is_error,
            })
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn invoke(
        &self,
        model: &Model,
        system_prompt: &str,
        history: &[Message],
        options: InvokeOptions,
    ) -> Result<InvokeResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut body = serde_json::json!({
            "model": model.name,
            "messages": Self::to_api_messages(history),
            "max_tokens": options.max_tokens.unwrap_or(model.max_output_tokens),
            "stream": true,
        });
        if !system_prompt.is_empty() {
            body["system"] = serde_json::json!(system_prompt);
        }
        if !options.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&options.tools));
        }

        debug!(
            provider = "anthropic",
            model = %model.name,
            messages = history.len(),
            "Sending streaming request"
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(sse::send_error)?;
        let response = sse::check_status("anthropic", response).await?;

        let mut stream = StreamState::new(&model.name);
        sse::for_each_line(response, |line| match sse::classify(line) {
            SseLine::Data(data) => stream.handle_data(data, &options),
            SseLine::Event(_) | SseLine::Other => Ok(true),
        })
        .await?;
        stream.finish()
    }
}

/// Block under construction.
enum PendingBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

/// Assembles one streamed response.
pub(crate) struct StreamState {
    model: String,
    blocks: Vec<ContentBlock>,
    pending: Option<PendingBlock>,
    usage: Usage,
    stop_reason: Option<String>,
}

impl StreamState {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            blocks: Vec::new(),
            pending: None,
            usage: Usage::default(),
            stop_reason: None,
        }
    }

    /// Handle one `data:` payload. Returns `false` once the message ends.
    pub fn handle_data(
        &mut self,
        data: &str,
        options: &InvokeOptions,
    ) -> Result<bool, ProviderError> {
        let event: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, data = %data, "Ignoring unparseable Anthropic SSE");
                return Ok(true);
            }
        };

        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                let message = &event["message"];
                if let Some(model) = message["model"].as_str() {
                    self.model = model.to_string();
                }
                self.read_usage(&message["usage"]);
            }
            "content_block_start" => {
                self.close_block();
                let block = &event["content_block"];
                self.pending = match block["type"].as_str() {
                    Some("text") => Some(PendingBlock::Text(
                        block["text"].as_str().unwrap_or("").to_string(),
                    )),
                    Some("tool_use") => Some(PendingBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        json: String::new(),
                    }),
                    _ => None,
                };
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match (delta["type"].as_str(), self.pending.as_mut()) {
                    (Some("text_delta"), Some(PendingBlock::Text(text))) => {
                        if let Some(chunk) = delta["text"].as_str() {
                            text.push_str(chunk);
                            emit_partial(options, chunk);
                        }
                    }
                    (Some("input_json_delta"), Some(PendingBlock::ToolUse { json, .. })) => {
                        if let Some(partial) = delta["partial_json"].as_str() {
                            json.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => self.close_block(),
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                self.read_usage(&event["usage"]);
            }
            "message_stop" => {
                self.close_block();
                return Ok(false);
            }
            "error" => {
                let error = &event["error"];
                let message = error["message"].as_str().unwrap_or("stream error").to_string();
                return Err(match error["type"].as_str() {
                    Some("overloaded_error") => ProviderError::Overloaded(message),
                    Some("rate_limit_error") => ProviderError::RateLimited {
                        retry_after_secs: taskforge_core::error::DEFAULT_RATE_LIMIT_BACKOFF_SECS,
                    },
                    Some("api_error") => ProviderError::StreamInterrupted(message),
                    _ => ProviderError::InvalidResponse(message),
                });
            }
            _ => {}
        }
        Ok(true)
    }

    /// Usage fields are cumulative; later events overwrite earlier ones.
    fn read_usage(&mut self, usage: &serde_json::Value) {
        let field = |name: &str| usage.get(name).and_then(|v| v.as_u64());
        if let Some(n) = field("input_tokens") {
            self.usage.input_tokens = n;
        }
        if let Some(n) = field("output_tokens") {
            self.usage.output_tokens = n;
        }
        if let Some(n) = field("cache_creation_input_tokens") {
            self.usage.cache_write_tokens = n;
        }
        if let Some(n) = field("cache_read_input_tokens") {
            self.usage.cache_read_tokens = n;
        }
    }

    fn close_block(&mut self) {
        match self.pending.take() {
            Some(PendingBlock::Text(text)) if !text.is_empty() => {
                self.blocks.push(ContentBlock::Text(text));
            }
            Some(PendingBlock::ToolUse { id, name, json }) => {
                let input = if json.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&json).unwrap_or(serde_json::Value::String(json))
                };
                self.blocks.push(ContentBlock::tool_call(id, &name, input));
            }
            _ => {}
        }
    }

    pub fn finish(mut self) -> Result<InvokeResponse, ProviderError> {
        self.close_block();
        if self.blocks.is_empty() && self.stop_reason.is_none() {
            return Err(ProviderError::StreamInterrupted(
                "stream ended before any content".into(),
            ));
        }
        Ok(InvokeResponse {
            content: self.blocks,
            usage: self.usage,
            model: self.model,
            stop_reason: self.stop_reason,
        })
    }
}

// --- Anthropic API types (internal) ---

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ApiBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use taskforge_core::task::TaskId;

    fn feed(state: &mut StreamState, events: &[serde_json::Value], options: &InvokeOptions) {
        for event in events {
            state.handle_data(&event.to_string(), options).unwrap();
        }
    }

    #[test]
    fn constructor_with_base_url() {
        let p = AnthropicProvider::new("sk-ant").with_base_url("https://proxy.example.com/");
        assert_eq!(p.base_url(), "https://proxy.example.com");
        assert_eq!(p.name(), "anthropic");
    }

    #[test]
    fn history_conversion_merges_user_turns() {
        let task = TaskId::from("t");
        let history = vec![
            Message::user(task.clone(), "list files"),
            Message::assistant(
                task.clone(),
                vec![
                    ContentBlock::text("Sure."),
                    ContentBlock::tool_call("call_1", "run_script", serde_json::json!({"script": "list_dir()"})),
                ],
            ),
            Message::system(
                task.clone(),
                vec![ContentBlock::CodeInterpreterResult {
                    call_id: "call_1".into(),
                    output: serde_json::json!(["a.rs"]),
                    console: String::new(),
                    function_calls: vec![],
                    error: None,
                }],
            ),
            Message::user(task, "thanks"),
        ];

        let api = serde_json::to_value(AnthropicProvider::to_api_messages(&history)).unwrap();
        let api = api.as_array().unwrap();
        assert_eq!(api.len(), 3);
        assert_eq!(api[1]["role"], "assistant");
        assert_eq!(api[1]["content"][1]["type"], "tool_use");
        assert_eq!(api[1]["content"][1]["input"]["script"], "list_dir()");
        assert_eq!(api[2]["role"], "user");
        assert_eq!(api[2]["content"][0]["type"], "tool_result");
        assert_eq!(api[2]["content"][0]["tool_use_id"], "call_1");
        assert!(api[2]["content"][0].get("is_error").is_none());
        assert_eq!(api[2]["content"][1]["text"], "thanks");
    }

    #[test]
    fn failed_tool_result_is_flagged() {
        let block = ContentBlock::NativeToolResult {
            call_id: "c".into(),
            name: "shell".into(),
            output: serde_json::Value::Null,
            error: Some("denied".into()),
        };
        let api = serde_json::to_value(AnthropicProvider::to_api_block(&block).unwrap()).unwrap();
        assert_eq!(api["is_error"], true);
        assert_eq!(api["content"], "Error: denied");
    }

    #[test]
    fn stream_assembles_text_and_tool_calls() {
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        let options = InvokeOptions::default()
            .with_partial(Arc::new(move |chunk: &str| sink.lock().unwrap().push_str(chunk)));
        let mut state = StreamState::new("requested");

        feed(
            &mut state,
            &[
                serde_json::json!({"type": "message_start", "message": {"model": "claude-sonnet-4-20250514",
                    "usage": {"input_tokens": 120, "output_tokens": 1, "cache_read_input_tokens": 80, "cache_creation_input_tokens": 10}}}),
                serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
                serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Let me "}}),
                serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "check."}}),
                serde_json::json!({"type": "content_block_stop", "index": 0}),
                serde_json::json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "run_script"}}),
                serde_json::json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"script\": \"list_"}}),
                serde_json::json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "dir()\"}"}}),
                serde_json::json!({"type": "content_block_stop", "index": 1}),
                serde_json::json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 42}}),
            ],
            &options,
        );
        assert!(!state.handle_data(r#"{"type": "message_stop"}"#, &options).unwrap());

        let response = state.finish().unwrap();
        assert_eq!(*seen.lock().unwrap(), "Let me check.");
        assert_eq!(response.model, "claude-sonnet-4-20250514");
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(response.usage.input_tokens, 120);
        assert_eq!(response.usage.output_tokens, 42);
        assert_eq!(response.usage.cache_read_tokens, 80);
        assert_eq!(response.usage.cache_write_tokens, 10);
        assert_eq!(response.content.len(), 2);
        assert_eq!(
            response.content[1],
            ContentBlock::CodeInterpreterCall {
                id: "toolu_1".into(),
                script: "list_dir()".into(),
            }
        );
    }

    #[test]
    fn native_tool_use_without_input() {
        let options = InvokeOptions::default();
        let mut state = StreamState::new("m");
        feed(
            &mut state,
            &[
                serde_json::json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "t", "name": "list_dir"}}),
                serde_json::json!({"type": "content_block_stop"}),
            ],
            &options,
        );
        let response = state.finish().unwrap();
        assert_eq!(response.content[0].kind(), "native-tool-call");
    }

    #[test]
    fn overloaded_stream_error_is_retryable() {
        let mut state = StreamState::new("m");
        let err = state
            .handle_data(
                r#"{"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}"#,
                &InvokeOptions::default(),
            )
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn empty_stream_is_interrupted() {
        let err = StreamState::new("m").finish().unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(_)));
    }
}
