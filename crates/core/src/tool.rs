//! HostTool trait: the capabilities a script can reach.
//!
//! Tools are the only way a sandboxed script touches the outside world:
//! files under the task root, allowlisted shell commands, HTTP fetches.
//! Anything not registered here does not exist inside the sandbox.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ToolError;
use crate::provider::ToolDefinition;
use crate::session::Session;

/// The core HostTool trait.
#[async_trait]
pub trait HostTool: Send + Sync {
    /// The unique name of this tool (e.g., "shell", "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Durable calls run to completion even if the task is suspended.
    fn is_durable(&self) -> bool {
        false
    }

    /// Execute the tool for the given session.
    async fn call(
        &self,
        session: &Session,
        input: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools, iterated in name order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn HostTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn HostTool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn with(mut self, tool: Arc<dyn HostTool>) -> Self {
        self.register(tool);
        self
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn HostTool>> {
        self.tools.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn HostTool>> {
        self.tools.values()
    }

    /// Get all tool definitions (for sending to the model).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    /// A simple test tool for unit tests.
    struct EchoTool;

    #[async_trait]
    impl HostTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn call(
            &self,
            _session: &Session,
            input: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, ToolError> {
            Ok(input["text"].clone())
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let registry = ToolRegistry::new().with(Arc::new(EchoTool));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_definitions() {
        let registry = ToolRegistry::new().with(Arc::new(EchoTool));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[0].parameters["required"][0], "text");
    }

    #[tokio::test]
    async fn tool_call_receives_session() {
        let registry = ToolRegistry::new().with(Arc::new(EchoTool));
        let session = Session::new(TaskId::from("t1"), "/tmp");
        let tool = registry.get("echo").unwrap();
        assert!(!tool.is_durable());
        let out = tool
            .call(&session, serde_json::json!({"text": "hello world"}))
            .await
            .unwrap();
        assert_eq!(out, "hello world");
    }
}
