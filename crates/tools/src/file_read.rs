//! File read tool: read file contents inside the task root.

use async_trait::async_trait;
use taskforge_core::error::ToolError;
use taskforge_core::session::Session;
use taskforge_core::tool::HostTool;

use crate::{required_str, resolve, truncate_output};

pub struct FileReadTool {
    max_bytes: usize,
}

impl FileReadTool {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

#[async_trait]
impl HostTool for FileReadTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file. Paths are relative to the project directory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn call(
        &self,
        session: &Session,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let path = required_str(&input, "path")?;
        let resolved = resolve(self.name(), session, path)?;

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: format!("Failed to read {path}: {e}"),
            })?;
        Ok(serde_json::Value::String(truncate_output(
            content,
            self.max_bytes,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::task::TaskId;

    #[test]
    fn tool_definition() {
        let tool = FileReadTool::new(1024);
        assert_eq!(tool.name(), "read_file");
        let schema = tool.parameters_schema();
        assert_eq!(schema["required"], serde_json::json!(["path"]));
        assert!(!tool.is_durable());
    }

    #[tokio::test]
    async fn read_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.txt"), "Hello, world!\n").unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());

        let out = FileReadTool::new(1024)
            .call(&session, serde_json::json!({"path": "test.txt"}))
            .await
            .unwrap();
        assert_eq!(out, "Hello, world!\n");
    }

    #[tokio::test]
    async fn large_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(100)).unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());

        let out = FileReadTool::new(10)
            .call(&session, serde_json::json!({"path": "big.txt"}))
            .await
            .unwrap();
        assert!(out.as_str().unwrap().contains("[truncated 90 bytes]"));
    }

    #[tokio::test]
    async fn read_outside_root_denied() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());
        let err = FileReadTool::new(1024)
            .call(&session, serde_json::json!({"path": "../../etc/passwd"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());
        let err = FileReadTool::new(1024)
            .call(&session, serde_json::json!({"path": "nope.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn missing_argument() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());
        let err = FileReadTool::new(1024)
            .call(&session, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
