//! Host tools for taskforge.
//!
//! Every tool is confined to the calling session's root directory. These
//! are the only capabilities a sandboxed script can reach.

pub mod fetch_url;
pub mod file_read;
pub mod file_write;
pub mod list_dir;
pub mod shell;

use std::sync::Arc;
use taskforge_config::ToolsConfig;
use taskforge_core::error::ToolError;
use taskforge_core::session::Session;
use taskforge_core::tool::ToolRegistry;

pub use fetch_url::FetchUrlTool;
pub use file_read::FileReadTool;
pub use file_write::FileWriteTool;
pub use list_dir::{ListDirTool, walk_tree};
pub use shell::ShellTool;

/// Create the default tool registry from configuration.
pub fn default_registry(config: &ToolsConfig) -> ToolRegistry {
    ToolRegistry::new()
        .with(Arc::new(FileReadTool::new(config.max_output_bytes)))
        .with(Arc::new(FileWriteTool))
        .with(Arc::new(ListDirTool::default()))
        .with(Arc::new(ShellTool::new(
            config.shell_allowlist.clone(),
            config.max_output_bytes,
        )))
        .with(Arc::new(FetchUrlTool::new(
            config.fetch_timeout_secs,
            config.max_output_bytes,
        )))
}

/// Resolve a tool path argument inside the session root.
pub(crate) fn resolve(
    tool_name: &str,
    session: &Session,
    path: &str,
) -> Result<std::path::PathBuf, ToolError> {
    taskforge_security::resolve_in_root(session.root(), path).map_err(|e| {
        ToolError::PermissionDenied {
            tool_name: tool_name.into(),
            reason: e.to_string(),
        }
    })
}

/// Cut `text` to at most `max` bytes on a char boundary, noting the cut.
pub fn truncate_output(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = text.len() - cut;
    text.truncate(cut);
    text.push_str(&format!("\n[truncated {dropped} bytes]"));
    text
}

pub(crate) fn required_str<'a>(
    input: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    input[key]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_all_tools() {
        let registry = default_registry(&ToolsConfig::default());
        assert_eq!(
            registry.names(),
            vec!["fetch_url", "list_dir", "read_file", "shell", "write_file"]
        );
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo".to_string();
        let cut = truncate_output(text, 2);
        assert!(cut.starts_with('h'));
        assert!(cut.contains("[truncated"));
        assert_eq!(truncate_output("short".into(), 10), "short");
    }
}
