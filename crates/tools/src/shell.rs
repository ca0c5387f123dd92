//! Shell command execution tool.
//!
//! Runs in the task root. Only commands whose program is on the allowlist
//! may run, and the child is killed if the call is dropped.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use taskforge_core::error::ToolError;
use taskforge_core::session::Session;
use taskforge_core::tool::HostTool;
use tokio::process::Command;

use crate::{required_str, truncate_output};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub struct ShellTool {
    allowed_commands: Vec<String>,
    max_output_bytes: usize,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, max_output_bytes: usize) -> Self {
        Self {
            allowed_commands,
            max_output_bytes,
        }
    }

    fn check_allowed(&self, command: &str) -> Result<(), ToolError> {
        if self.allowed_commands.is_empty() {
            return Ok(());
        }
        let program = command.split_whitespace().next().unwrap_or("");
        // Chained commands would bypass the first-word check.
        let chained = ["&&", "||", ";", "|", "`", "$("]
            .iter()
            .any(|op| command.contains(op));
        if chained || !self.allowed_commands.iter().any(|c| c == program) {
            return Err(ToolError::PermissionDenied {
                tool_name: "shell".into(),
                reason: format!("Command '{program}' is not in the allowlist"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HostTool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the project directory and return its exit code and output."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Maximum run time in seconds",
                    "default": DEFAULT_TIMEOUT_SECS
                }
            },
            "required": ["command"]
        })
    }

    async fn call(
        &self,
        session: &Session,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let command = required_str(&input, "command")?;
        self.check_allowed(command)?;
        let timeout_secs = input["timeout_secs"].as_u64().unwrap_or(DEFAULT_TIMEOUT_SECS);

        tracing::debug!(task_id = %session.task_id(), command, "Running shell command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(session.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "shell".into(),
                reason: format!("Failed to spawn: {e}"),
            })?;

        let output = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| ToolError::Timeout {
            tool_name: "shell".into(),
            timeout_secs,
        })?
        .map_err(|e| ToolError::ExecutionFailed {
            tool_name: "shell".into(),
            reason: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        Ok(serde_json::json!({
            "exit_code": output.status.code(),
            "stdout": truncate_output(stdout, self.max_output_bytes),
            "stderr": truncate_output(stderr, self.max_output_bytes),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::task::TaskId;

    fn tool(allowed: &[&str]) -> ShellTool {
        ShellTool::new(allowed.iter().map(|s| s.to_string()).collect(), 1024)
    }

    #[test]
    fn allowlist_checks_program() {
        let t = tool(&["ls", "echo"]);
        assert!(t.check_allowed("ls -la").is_ok());
        assert!(t.check_allowed("rm -rf /").is_err());
        assert!(t.check_allowed("ls; rm -rf /").is_err());
        assert!(t.check_allowed("echo $(whoami)").is_err());
    }

    #[test]
    fn empty_allowlist_permits_everything() {
        assert!(tool(&[]).check_allowed("anything goes").is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_in_session_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());

        let out = tool(&["ls"])
            .call(&session, serde_json::json!({"command": "ls"}))
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 0);
        assert!(out["stdout"].as_str().unwrap().contains("marker.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());
        let out = tool(&["ls"])
            .call(&session, serde_json::json!({"command": "ls does-not-exist"}))
            .await
            .unwrap();
        assert_ne!(out["exit_code"], 0);
        assert!(!out["stderr"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disallowed_command_denied() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());
        let err = tool(&["ls"])
            .call(&session, serde_json::json!({"command": "curl evil.example"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(TaskId::from("t"), dir.path());
        let err = tool(&["sleep"])
            .call(&session, serde_json::json!({"command": "sleep 5", "timeout_secs": 0}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }
}
