//! rhai engine construction.

use rhai::{Dynamic, Engine, EvalAltResult, Map, Position};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use taskforge_config::InterpreterConfig;
use taskforge_core::error::InterpreterError;
use tokio::runtime::Handle;

use crate::interceptor::ToolHandler;

pub(crate) const RUNNING: u8 = 0;
pub(crate) const CANCELLED: u8 = 1;
pub(crate) const TIMED_OUT: u8 = 2;

/// Shared stop signal polled at every engine safepoint.
#[derive(Clone)]
pub(crate) struct StopFlag(Arc<AtomicU8>);

impl StopFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(RUNNING)))
    }

    /// Move from running to `state`; later signals do not overwrite the first.
    pub fn signal(&self, state: u8) {
        let _ = self
            .0
            .compare_exchange(RUNNING, state, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) type Console = Arc<Mutex<String>>;

fn append(console: &Console, line: &str) {
    let mut buf = console.lock().unwrap_or_else(|e| e.into_inner());
    buf.push_str(line);
    buf.push('\n');
}

/// Build a fresh engine exposing exactly `bindings` as host functions.
pub(crate) fn build_engine(
    limits: &InterpreterConfig,
    stop: StopFlag,
    deadline: Instant,
    console: Console,
    bindings: Vec<(String, ToolHandler)>,
    handle: Handle,
) -> Engine {
    let mut engine = Engine::new();
    engine
        .set_max_operations(limits.max_operations)
        .set_max_call_levels(limits.max_call_depth)
        .set_max_string_size(limits.max_string_size)
        .set_max_array_size(limits.max_collection_size)
        .set_max_map_size(limits.max_collection_size)
        .set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new())
        .disable_symbol("eval");

    let print_console = console.clone();
    engine.on_print(move |text| append(&print_console, text));
    engine.on_debug(move |text, _source, pos| {
        append(&console, &format!("[debug {pos}] {text}"));
    });

    engine.on_progress(move |_ops| {
        if stop.get() == RUNNING && Instant::now() >= deadline {
            stop.signal(TIMED_OUT);
        }
        (stop.get() != RUNNING).then_some(Dynamic::UNIT)
    });

    for (name, handler) in bindings {
        let with_args = {
            let handler = handler.clone();
            let handle = handle.clone();
            move |args: Map| invoke(&handle, &handler, Dynamic::from_map(args))
        };
        let handle = handle.clone();
        let without_args = move || invoke(&handle, &handler, Dynamic::from_map(Map::new()));
        engine.register_fn(name.clone(), with_args);
        engine.register_fn(name, without_args);
    }

    engine
}

/// Run one tool call from inside the script thread.
fn invoke(
    handle: &Handle,
    handler: &ToolHandler,
    args: Dynamic,
) -> Result<Dynamic, Box<EvalAltResult>> {
    let input: serde_json::Value = rhai::serde::from_dynamic(&args)?;
    let output = handle
        .block_on(handler(input))
        .map_err(|e| -> Box<EvalAltResult> { e.to_string().into() })?;
    rhai::serde::to_dynamic(output)
}

/// Reduce an engine error to its underlying cause.
pub(crate) fn unwrap_error(err: &EvalAltResult, stop: u8, timeout_secs: u64) -> InterpreterError {
    match stop {
        CANCELLED => return InterpreterError::Cancelled,
        TIMED_OUT => return InterpreterError::TimedOut(timeout_secs),
        _ => {}
    }
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => {
            unwrap_error(inner, stop, timeout_secs)
        }
        EvalAltResult::ErrorRuntime(value, _) => InterpreterError::Script(value.to_string()),
        EvalAltResult::ErrorTerminated(_, _) => InterpreterError::Cancelled,
        other => InterpreterError::Script(strip_position(other)),
    }
}

fn strip_position(err: &EvalAltResult) -> String {
    let text = err.to_string();
    if err.position() == Position::NONE {
        return text;
    }
    text.rsplit_once(" (line ")
        .map(|(head, _)| head.to_string())
        .unwrap_or(text)
}
