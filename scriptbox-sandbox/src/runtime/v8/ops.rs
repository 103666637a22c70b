//! Ops backing the scaffolding of an assembled program

use crate::files::{ContentMode, FileProxies};
use deno_core::{op2, Extension, OpState};
use deno_error::JsErrorBox;
use scriptbox_common::{LogLevel, LogRecord};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Globals handed to the bootstrap script
pub(crate) struct ContextGlobals(pub Map<String, Value>);

/// Records written by the per-execution console
#[derive(Default)]
pub(crate) struct LogBuffer(pub Vec<LogRecord>);

/// How the script settled. Only the first settlement counts.
pub(crate) enum Settlement {
    Output(String),
    Error(String),
}

#[op2]
#[serde]
fn op_sbx_globals(state: &mut OpState) -> serde_json::Value {
    state
        .try_take::<ContextGlobals>()
        .map(|globals| Value::Object(globals.0))
        .unwrap_or_else(|| Value::Object(Map::new()))
}

#[op2(fast)]
fn op_sbx_log(state: &mut OpState, #[string] level: &str, #[string] message: &str) {
    let level = LogLevel::from_name(level);
    match level {
        LogLevel::Info => tracing::info!(target: "scriptbox::script", "{}", message),
        LogLevel::Warn => tracing::warn!(target: "scriptbox::script", "{}", message),
        LogLevel::Error => tracing::error!(target: "scriptbox::script", "{}", message),
    }

    if !state.has::<LogBuffer>() {
        state.put(LogBuffer::default());
    }
    state
        .borrow_mut::<LogBuffer>()
        .0
        .push(LogRecord::new(level, message));
}

#[op2(fast)]
fn op_sbx_set_output(state: &mut OpState, #[string] json: &str) {
    if !state.has::<Settlement>() {
        state.put(Settlement::Output(json.to_string()));
    }
}

#[op2(fast)]
fn op_sbx_set_error(state: &mut OpState, #[string] stack: &str) {
    if !state.has::<Settlement>() {
        state.put(Settlement::Error(stack.to_string()));
    }
}

fn proxies(state: &OpState) -> Result<Arc<FileProxies>, JsErrorBox> {
    state
        .try_borrow::<Arc<FileProxies>>()
        .cloned()
        .ok_or_else(|| JsErrorBox::generic("No files are attached to this execution"))
}

/// `readContents(mode)`: parks the interpreter thread until the bytes arrive
#[op2]
#[string]
fn op_sbx_read_file(
    state: &mut OpState,
    #[smi] id: u32,
    #[string] mode: &str,
) -> Result<String, JsErrorBox> {
    let files = proxies(state)?;
    files
        .read_blocking(id as usize, ContentMode::parse(mode))
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// `readContentsAsync(mode)`
#[op2(async)]
#[string]
async fn op_sbx_read_file_async(
    state: Rc<RefCell<OpState>>,
    #[smi] id: u32,
    #[string] mode: String,
) -> Result<String, JsErrorBox> {
    let files = proxies(&state.borrow())?;
    files
        .read_async(id as usize, ContentMode::parse(&mode))
        .await
        .map_err(|e| JsErrorBox::generic(e.to_string()))
}

/// Extension carrying every op the program scaffolding calls
pub(crate) fn sandbox_extension() -> Extension {
    let ops = vec![
        op_sbx_globals(),
        op_sbx_log(),
        op_sbx_set_output(),
        op_sbx_set_error(),
        op_sbx_read_file(),
        op_sbx_read_file_async(),
    ];

    Extension {
        name: "scriptbox_sandbox",
        ops: std::borrow::Cow::Owned(ops),
        ..Default::default()
    }
}
