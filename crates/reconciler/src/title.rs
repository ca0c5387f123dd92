//! Background title generation, at most one in flight per task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use taskforge_core::{
    Error, InvokeOptions, Message, ProviderResolver, Result, Store, Task, TaskId,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const TITLE_PROMPT: &str = "Summarize the user's request as a short title of at most six \
words. Reply with the title only, without quotes or trailing punctuation.";

const MAX_TITLE_CHARS: usize = 60;

pub struct TitleGenerator {
    store: Arc<dyn Store>,
    resolver: Arc<dyn ProviderResolver>,
    inflight: Arc<Mutex<HashSet<TaskId>>>,
}

impl TitleGenerator {
    pub fn new(store: Arc<dyn Store>, resolver: Arc<dyn ProviderResolver>) -> Self {
        Self {
            store,
            resolver,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.lock().contains(task_id)
    }

    /// Start generating a title for `task` from `request`.
    ///
    /// Returns `None` when a generation for the task is already running.
    pub fn spawn(self: &Arc<Self>, task: &Task, request: &str) -> Option<JoinHandle<()>> {
        if !self.lock().insert(task.id.clone()) {
            debug!(task_id = %task.id, "Title generation already in flight");
            return None;
        }
        let slot = InflightSlot {
            inflight: self.inflight.clone(),
            task_id: task.id.clone(),
        };

        let this = self.clone();
        let task = task.clone();
        let request = request.to_string();
        Some(tokio::spawn(async move {
            let _slot = slot;
            let title = match this.generate(&task, &request).await {
                Ok(title) if !title.is_empty() => title,
                Ok(_) => fallback_title(&request),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Title generation failed");
                    fallback_title(&request)
                }
            };
            match this.store.set_task_title(&task.id, &title).await {
                Ok(()) => debug!(task_id = %task.id, title = %title, "Task titled"),
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to store task title"),
            }
        }))
    }

    async fn generate(&self, task: &Task, request: &str) -> Result<String> {
        let agent = self
            .store
            .get_agent(&task.agent_id)
            .await?
            .ok_or_else(|| Error::not_found("agent", &task.agent_id))?;
        let model = self
            .store
            .get_model(&agent.model_id)
            .await?
            .ok_or_else(|| Error::not_found("model", &agent.model_id))?;
        let record = self
            .store
            .get_provider(&model.provider_id)
            .await?
            .ok_or_else(|| Error::not_found("provider", &model.provider_id))?;
        let provider = self.resolver.resolve(&model, &record).await?;

        let history = [Message::user(task.id.clone(), request)];
        let options = InvokeOptions::default().with_max_tokens(32);
        let response = provider
            .invoke(&model, TITLE_PROMPT, &history, options)
            .await?;
        let reply = Message::assistant(task.id.clone(), response.content);
        Ok(clean_title(&reply.text()))
    }
}

/// Releases the task's slot even if the generation task panics.
struct InflightSlot {
    inflight: Arc<Mutex<HashSet<TaskId>>>,
    task_id: TaskId,
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

fn clean_title(raw: &str) -> String {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let stripped = line
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim_end_matches('.');
    truncate(&collapse_whitespace(stripped))
}

/// Title derived from the request itself.
pub fn fallback_title(request: &str) -> String {
    let line = request
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let collapsed = collapse_whitespace(line);
    if collapsed.is_empty() {
        return "Untitled task".to_string();
    }
    truncate(&collapsed)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_TITLE_CHARS {
        return s.to_string();
    }
    let head: String = s.chars().take(MAX_TITLE_CHARS).collect();
    format!("{}…", head.trim_end())
}
