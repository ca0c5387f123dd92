//! Directory listing tool, honouring `.gitignore`.

use async_trait::async_trait;
use ignore::WalkBuilder;
use std::path::Path;
use taskforge_core::error::ToolError;
use taskforge_core::session::Session;
use taskforge_core::tool::HostTool;

use crate::resolve;

/// Walk `root` up to `max_depth` levels and return at most `limit` entries.
///
/// Entries are relative to `root`, sorted, with a trailing `/` on
/// directories. Hidden and git-ignored files are skipped.
pub fn walk_tree(root: &Path, max_depth: usize, limit: usize) -> Vec<String> {
    let walker = WalkBuilder::new(root)
        .max_depth(Some(max_depth))
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut entries = Vec::new();
    for entry in walker.flatten() {
        if entries.len() >= limit {
            break;
        }
        if entry.depth() == 0 {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let mut name = relative.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_some_and(|t| t.is_dir()) {
            name.push('/');
        }
        entries.push(name);
    }
    entries
}

pub struct ListDirTool {
    limit: usize,
}

impl Default for ListDirTool {
    fn default() -> Self {
        Self { limit: 500 }
    }
}

#[async_trait]
impl HostTool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List files and directories. Directories end with '/'. Ignored files are skipped."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list, defaults to the project root",
                    "default": "."
                },
                "depth": {
                    "type": "integer",
                    "description": "How many levels to descend",
                    "default": 1
                }
            }
        })
    }

    async fn call(
        &self,
        session: &Session,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let path = input["path"].as_str().unwrap_or(".");
        let depth = input["depth"].as_u64().unwrap_or(1).clamp(1, 10) as usize;
        let resolved = resolve(self.name(), session, path)?;
        if !resolved.is_dir() {
            return Err(ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: format!("{path} is not a directory"),
            });
        }

        let limit = self.limit;
        let entries = tokio::task::spawn_blocking(move || walk_tree(&resolved, depth, limit))
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "list_dir".into(),
                reason: e.to_string(),
            })?;
        Ok(serde_json::json!(entries))
    }
}
