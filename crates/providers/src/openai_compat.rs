//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM and any endpoint exposing
//! a streaming `/chat/completions` route with function calling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use taskforge_core::agent::Model;
use taskforge_core::error::ProviderError;
use taskforge_core::message::{ContentBlock, Message, MessageSource};
use taskforge_core::provider::{
    InvokeOptions, InvokeResponse, ModelProvider, ToolDefinition, Usage, emit_partial,
};
use tracing::{debug, trace};

use crate::sse::{self, SseLine};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", DEFAULT_BASE_URL, api_key)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert history to chat messages.
    ///
    /// Tool results become `tool` role messages; any text in the same
    /// message follows as a user turn.
    fn to_api_messages(system_prompt: &str, history: &[Message]) -> Vec<ApiMessage> {
        let mut result = Vec::new();
        if !system_prompt.is_empty() {
            result.push(ApiMessage::text("system", system_prompt));
        }

        for msg in history {
            let text = msg.text();
            match msg.source {
                MessageSource::Assistant => {
                    let tool_calls: Vec<ApiToolCall> = msg
                        .content
                        .iter()
                        .filter_map(ContentBlock::as_tool_use)
                        .map(|(id, name, input)| ApiToolCall {
                            id: id.to_string(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: name.to_string(),
                                arguments: input.to_string(),
                            },
                        })
                        .collect();
                    if text.is_empty() && tool_calls.is_empty() {
                        continue;
                    }
                    result.push(ApiMessage {
                        role: "assistant".into(),
                        content: (!text.is_empty()).then_some(text),
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                        tool_call_id: None,
                    });
                }
                MessageSource::User | MessageSource::System => {
                    for (call_id, content, _) in
                        msg.content.iter().filter_map(ContentBlock::as_tool_result)
                    {
                        result.push(ApiMessage {
                            role: "tool".into(),
                            content: Some(content),
                            tool_calls: None,
                            tool_call_id: Some(call_id.to_string()),
                        });
                    }
                    if !text.is_empty() {
                        result.push(ApiMessage::text("user", &text));
                    }
                }
            }
        }

        result
    }

    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        model: &Model,
        system_prompt: &str,
        history: &[Message],
        options: InvokeOptions,
    ) -> Result<InvokeResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = serde_json::json!({
            "model": model.name,
            "messages": Self::to_api_messages(system_prompt, history),
            "max_tokens": options.max_tokens.unwrap_or(model.max_output_tokens),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !options.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&options.tools));
        }

        debug!(provider = %self.name, model = %model.name, "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(sse::send_error)?;
        let response = sse::check_status(&self.name, response).await?;

        let mut stream = StreamState::new(&model.name);
        sse::for_each_line(response, |line| match sse::classify(line) {
            SseLine::Data(data) => Ok(stream.handle_data(data, &options)),
            SseLine::Event(_) | SseLine::Other => Ok(true),
        })
        .await?;
        stream.finish()
    }
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles one streamed completion.
pub(crate) struct StreamState {
    model: String,
    text: String,
    /// Keyed by the delta's index so calls keep their order
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl StreamState {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            text: String::new(),
            tool_calls: BTreeMap::new(),
            usage: None,
            finish_reason: None,
        }
    }

    /// Handle one `data:` payload. Returns `false` at `[DONE]`.
    pub fn handle_data(&mut self, data: &str, options: &InvokeOptions) -> bool {
        if data == "[DONE]" {
            return false;
        }
        let chunk: StreamResponse = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
                return true;
            }
        };

        if let Some(model) = chunk.model {
            self.model = model;
        }
        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                emit_partial(options, &content);
                self.text.push_str(&content);
            }
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let acc = self.tool_calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    acc.id = id;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        acc.name = name;
                    }
                    if let Some(args) = function.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        if let Some(usage) = chunk.usage {
            let cached = usage
                .prompt_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0);
            self.usage = Some(Usage {
                input_tokens: usage.prompt_tokens.saturating_sub(cached),
                output_tokens: usage.completion_tokens,
                cache_write_tokens: 0,
                cache_read_tokens: cached,
            });
        }
        true
    }

    pub fn finish(self) -> Result<InvokeResponse, ProviderError> {
        if self.text.is_empty() && self.tool_calls.is_empty() && self.finish_reason.is_none() {
            return Err(ProviderError::StreamInterrupted(
                "stream ended before any content".into(),
            ));
        }
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::Text(self.text));
        }
        for acc in self.tool_calls.into_values() {
            let input = if acc.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&acc.arguments)
                    .unwrap_or(serde_json::Value::String(acc.arguments))
            };
            content.push(ContentBlock::tool_call(acc.id, &acc.name, input));
        }
        Ok(InvokeResponse {
            content,
            usage: self.usage.unwrap_or_default(),
            model: self.model,
            stop_reason: self.finish_reason,
        })
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}
