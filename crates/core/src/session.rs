//! Per-execution state shared by tool bindings and interceptors.
//!
//! A `Session` lives for exactly one interpreter run. It records which tool
//! is running, every function call the script made, and a typed scratch map
//! interceptors use to hand state to each other.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::task::TaskId;

/// One host function call made during a script run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRecord {
    pub tool: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type Scratch = HashMap<String, Box<dyn Any + Send + Sync>>;

#[derive(Default)]
struct SessionState {
    current_tool: Option<String>,
    function_calls: Vec<FunctionCallRecord>,
    values: Scratch,
    temp: Scratch,
}

/// Cheaply cloneable handle to one execution's state.
#[derive(Clone)]
pub struct Session {
    task_id: TaskId,
    root: PathBuf,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    pub fn new(task_id: TaskId, root: impl Into<PathBuf>) -> Self {
        Self {
            task_id,
            root: root.into(),
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Sandbox root every file and process tool is confined to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // A panicking tool must not wedge the rest of the run.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current_tool(&self) -> Option<String> {
        self.lock().current_tool.clone()
    }

    pub fn set_current_tool(&self, name: Option<String>) {
        self.lock().current_tool = name;
    }

    pub fn record_call(&self, record: FunctionCallRecord) {
        self.lock().function_calls.push(record);
    }

    pub fn function_calls(&self) -> Vec<FunctionCallRecord> {
        self.lock().function_calls.clone()
    }

    // --- Script-scoped scratch ---

    pub fn set<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.lock().values.insert(key.to_string(), Box::new(value));
    }

    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.lock()
            .values
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Mutate a value in place, inserting `T::default()` first if absent
    /// or of another type.
    pub fn update<T, R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Any + Send + Sync + Default,
    {
        let mut state = self.lock();
        let slot = state
            .values
            .entry(key.to_string())
            .or_insert_with(|| Box::new(T::default()));
        if !slot.is::<T>() {
            *slot = Box::new(T::default());
        }
        match slot.downcast_mut::<T>() {
            Some(value) => f(value),
            None => f(&mut T::default()),
        }
    }

    pub fn remove(&self, key: &str) {
        self.lock().values.remove(key);
    }

    // --- Per-call scratch, cleared after each tool call ---

    pub fn set_temp<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.lock().temp.insert(key.to_string(), Box::new(value));
    }

    pub fn get_temp<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.lock()
            .temp
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn clear_temp(&self) {
        self.lock().temp.clear();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Session")
            .field("task_id", &self.task_id)
            .field("root", &self.root)
            .field("current_tool", &state.current_tool)
            .field("function_calls", &state.function_calls.len())
            .finish()
    }
}
