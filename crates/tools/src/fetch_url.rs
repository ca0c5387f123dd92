//! URL fetch tool: HTTP GET with a timeout.

use async_trait::async_trait;
use std::time::Duration;
use taskforge_core::error::ToolError;
use taskforge_core::session::Session;
use taskforge_core::tool::HostTool;

use crate::{required_str, truncate_output};

pub struct FetchUrlTool {
    client: reqwest::Client,
    timeout_secs: u64,
    max_bytes: usize,
}

impl FetchUrlTool {
    pub fn new(timeout_secs: u64, max_bytes: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("taskforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            timeout_secs,
            max_bytes,
        }
    }

    fn failed(reason: impl Into<String>) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: "fetch_url".into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl HostTool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP(S) and return the status, content type and body text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http or https URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    async fn call(
        &self,
        session: &Session,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let url = required_str(&input, "url")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArguments(
                "URL must start with http:// or https://".into(),
            ));
        }

        tracing::debug!(task_id = %session.task_id(), url, "Fetching URL");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout {
                    tool_name: "fetch_url".into(),
                    timeout_secs: self.timeout_secs,
                }
            } else {
                Self::failed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| Self::failed(e.to_string()))?;

        Ok(serde_json::json!({
            "status": status,
            "content_type": content_type,
            "body": truncate_output(body, self.max_bytes),
        }))
    }
}
