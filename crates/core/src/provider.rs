//! Provider trait: the abstraction over model backends.
//!
//! A provider takes a system prompt and the task's message history and
//! returns the model's reply as content blocks, streaming partial text to an
//! optional callback while it arrives.
//!
//! Implementations: Anthropic Messages, OpenAI-compatible Chat Completions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agent::{Model, ProviderRecord};
use crate::error::ProviderError;
use crate::message::{ContentBlock, Message};

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

/// Receives each chunk of streamed text.
pub type PartialCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-call options.
#[derive(Clone, Default)]
pub struct InvokeOptions {
    /// Tools the model may call
    pub tools: Vec<ToolDefinition>,

    /// Streaming text callback
    pub on_partial: Option<PartialCallback>,

    /// Overrides the model's default output limit
    pub max_tokens: Option<u32>,
}

impl InvokeOptions {
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_partial(mut self, callback: PartialCallback) -> Self {
        self.on_partial = Some(callback);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub(crate) fn emit_partial(&self, text: &str) {
        if let Some(cb) = &self.on_partial {
            cb(text);
        }
    }
}

impl std::fmt::Debug for InvokeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeOptions")
            .field("tools", &self.tools.len())
            .field("on_partial", &self.on_partial.is_some())
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// A complete model reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    /// Text and tool-call blocks, in the order the model produced them
    pub content: Vec<ContentBlock>,

    pub usage: Usage,

    /// Which model actually responded (may differ from requested)
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// The core ModelProvider trait.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for logging (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Run one model call over the full ordered history.
    ///
    /// Dropping the returned future aborts the request.
    async fn invoke(
        &self,
        model: &Model,
        system_prompt: &str,
        history: &[Message],
        options: InvokeOptions,
    ) -> std::result::Result<InvokeResponse, ProviderError>;
}

/// Turns a model and its provider record into a ready client.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn resolve(
        &self,
        model: &Model,
        record: &ProviderRecord,
    ) -> std::result::Result<Arc<dyn ModelProvider>, ProviderError>;
}

/// Forwards partial text through the options callback.
///
/// Providers call this as deltas arrive so the callback stays optional.
pub fn emit_partial(options: &InvokeOptions, text: &str) {
    options.emit_partial(text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn partial_callback_receives_chunks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = InvokeOptions::default().with_partial(Arc::new(move |chunk: &str| {
            sink.lock().unwrap().push(chunk.to_string());
        }));
        emit_partial(&options, "Hel");
        emit_partial(&options, "lo");
        assert_eq!(*seen.lock().unwrap(), vec!["Hel", "lo"]);
    }

    #[test]
    fn options_without_callback_ignore_partials() {
        let options = InvokeOptions::default().with_max_tokens(100);
        emit_partial(&options, "dropped");
        assert_eq!(options.max_tokens, Some(100));
    }

    #[test]
    fn usage_defaults_missing_fields() {
        let usage: Usage = serde_json::from_str(r#"{"input_tokens": 10}"#).unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.cache_read_tokens, 0);
    }
}
