//! System prompt rendering.
//!
//! Agent instructions are a template. `{{ name }}` placeholders are filled
//! with facts about the environment the task runs in:
//!
//! | placeholder | value |
//! |---|---|
//! | `working_dir` | the task's project directory |
//! | `os` | host operating system |
//! | `shell` | `$SHELL`, or `sh` |
//! | `directory_listing` | depth-limited listing of `working_dir` |
//! | `tools` | one line per tool the model may call |
//! | `date` | today's date (UTC) |
//!
//! Unknown placeholders are left untouched. Instructions that use none of
//! the known names get an environment section appended instead.

use regex_lite::{Captures, Regex};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use taskforge_core::ToolDefinition;

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}").ok());

const KNOWN: [&str; 6] = ["working_dir", "os", "shell", "directory_listing", "tools", "date"];

/// Environment facts for one model invocation.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub working_dir: PathBuf,
    pub os: String,
    pub shell: String,
    pub directory_listing: Vec<String>,
    pub tools: Vec<ToolDefinition>,
    pub date: String,
}

impl PromptContext {
    /// Collect facts about `root`. The directory walk runs off the runtime.
    pub async fn gather(
        root: &Path,
        depth: usize,
        limit: usize,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        let walk_root = root.to_path_buf();
        let directory_listing = tokio::task::spawn_blocking(move || {
            taskforge_tools::walk_tree(&walk_root, depth, limit)
        })
        .await
        .unwrap_or_default();

        Self {
            working_dir: root.to_path_buf(),
            os: std::env::consts::OS.to_string(),
            shell: std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string()),
            directory_listing,
            tools,
            date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
        }
    }

    fn value(&self, name: &str) -> Option<String> {
        Some(match name {
            "working_dir" => self.working_dir.display().to_string(),
            "os" => self.os.clone(),
            "shell" => self.shell.clone(),
            "directory_listing" => self.listing(),
            "tools" => self.tool_lines(),
            "date" => self.date.clone(),
            _ => return None,
        })
    }

    fn listing(&self) -> String {
        if self.directory_listing.is_empty() {
            return "(empty)".to_string();
        }
        self.directory_listing.join("\n")
    }

    fn tool_lines(&self) -> String {
        self.tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn environment_section(&self) -> String {
        format!(
            "## Environment\n\
             Working directory: {}\n\
             Operating system: {}\n\
             Shell: {}\n\
             Date: {}\n\n\
             ## Directory listing\n{}\n\n\
             ## Tools\n{}",
            self.working_dir.display(),
            self.os,
            self.shell,
            self.date,
            self.listing(),
            self.tool_lines(),
        )
    }
}

/// Interpolate `template` with `ctx`.
pub fn render(template: &str, ctx: &PromptContext) -> String {
    let Some(re) = PLACEHOLDER.as_ref() else {
        return template.to_string();
    };

    let uses_known = re
        .captures_iter(template)
        .any(|c| KNOWN.contains(&&c[1]));
    if !uses_known {
        let base = template.trim_end();
        if base.is_empty() {
            return ctx.environment_section();
        }
        return format!("{base}\n\n{}", ctx.environment_section());
    }

    re.replace_all(template, |caps: &Captures<'_>| {
        ctx.value(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PromptContext {
        PromptContext {
            working_dir: PathBuf::from("/work/project"),
            os: "linux".into(),
            shell: "/bin/zsh".into(),
            directory_listing: vec!["src/".into(), "src/main.rs".into()],
            tools: vec![ToolDefinition {
                name: "shell".into(),
                description: "Run a command".into(),
                parameters: serde_json::json!({}),
            }],
            date: "2026-01-02".into(),
        }
    }

    #[test]
    fn fills_known_placeholders() {
        let out = render("You work in {{ working_dir }} on {{os}} using {{ shell }}.", &ctx());
        assert_eq!(out, "You work in /work/project on linux using /bin/zsh.");
    }

    #[test]
    fn renders_listing_and_tools() {
        let out = render("{{ directory_listing }}\n---\n{{ tools }}", &ctx());
        assert_eq!(out, "src/\nsrc/main.rs\n---\n- shell: Run a command");
    }

    #[test]
    fn unknown_placeholders_survive() {
        let out = render("{{ date }} {{ mood }}", &ctx());
        assert_eq!(out, "2026-01-02 {{ mood }}");
    }

    #[test]
    fn plain_instructions_get_environment_section() {
        let out = render("Be concise.", &ctx());
        assert!(out.starts_with("Be concise.\n\n## Environment"));
        assert!(out.contains("Working directory: /work/project"));
        assert!(out.contains("- shell: Run a command"));
    }

    #[tokio::test]
    async fn gather_lists_project_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let ctx = PromptContext::gather(dir.path(), 2, 50, vec![]).await;
        assert_eq!(ctx.directory_listing, vec!["notes.txt".to_string()]);
        assert_eq!(ctx.os, std::env::consts::OS);
    }
}
