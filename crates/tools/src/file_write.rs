//! File write tool: create or overwrite files inside the task root.
//!
//! Writes are durable: a suspend does not interrupt them halfway.

use async_trait::async_trait;
use taskforge_core::error::ToolError;
use taskforge_core::session::Session;
use taskforge_core::tool::HostTool;
use tokio::io::AsyncWriteExt;

use crate::{required_str, resolve};

pub struct FileWriteTool;

#[async_trait]
impl HostTool for FileWriteTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file, creating parent directories as needed. Set append to add to the end instead of replacing."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write"
                },
                "content": {
                    "type": "string",
                    "description": "The text to write"
                },
                "append": {
                    "type": "boolean",
                    "description": "Append instead of overwrite",
                    "default": false
                }
            },
            "required": ["path", "content"]
        })
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn call(
        &self,
        session: &Session,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let path = required_str(&input, "path")?;
        let content = required_str(&input, "content")?;
        let append = input["append"].as_bool().unwrap_or(false);
        let resolved = resolve(self.name(), session, path)?;

        let failed = |e: std::io::Error| ToolError::ExecutionFailed {
            tool_name: "write_file".into(),
            reason: format!("Failed to write {path}: {e}"),
        };

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(failed)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&resolved)
            .await
            .map_err(failed)?;
        file.write_all(content.as_bytes()).await.map_err(failed)?;
        file.flush().await.map_err(failed)?;

        Ok(serde_json::json!({
            "path": path,
            "bytes_written": content.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::task::TaskId;

    #[tokio::test]
    async fn write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());
        let out = FileWriteTool
            .call(
                &session,
                serde_json::json!({"path": "src/deep/main.rs", "content": "fn main() {}"}),
            )
            .await
            .unwrap();
        assert_eq!(out["bytes_written"], 12);
        let written = std::fs::read_to_string(dir.path().join("src/deep/main.rs")).unwrap();
        assert_eq!(written, "fn main() {}");
    }

    #[tokio::test]
    async fn append_mode() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());
        for line in ["a\n", "b\n"] {
            FileWriteTool
                .call(
                    &session,
                    serde_json::json!({"path": "log.txt", "content": line, "append": true}),
                )
                .await
                .unwrap();
        }
        assert_eq!(std::fs::read_to_string(dir.path().join("log.txt")).unwrap(), "a\nb\n");
    }

    #[tokio::test]
    async fn write_outside_root_denied() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());
        let err = FileWriteTool
            .call(
                &session,
                serde_json::json!({"path": "/tmp/../etc/evil", "content": "x"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[test]
    fn writes_are_durable() {
        assert!(FileWriteTool.is_durable());
    }
}
