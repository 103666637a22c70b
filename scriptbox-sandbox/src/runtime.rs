//! Execution sandbox trait and the per-execution control handle

pub mod v8;

use crate::error::SandboxError;
use crate::files::FileProxies;
use crate::program::SandboxProgram;
use async_trait::async_trait;
use scriptbox_common::LogRecord;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub use v8::V8Sandbox;

/// Runs an assembled program inside an isolated interpreter instance.
///
/// Implementations are driven from a worker thread with its own
/// current-thread tokio runtime, so the returned future need not be `Send`.
#[async_trait(?Send)]
pub trait ExecutionSandbox: Send + Sync {
    /// Execute `program` against `env`.
    ///
    /// Script exceptions are not errors at this level: they come back as
    /// [`ScriptResult::Failed`] with the original, unmodified stack.
    async fn run(&self, program: &SandboxProgram, env: SandboxEnv) -> Result<RawOutcome, SandboxError>;

    /// Get sandbox name
    fn name(&self) -> &str;
}

/// Everything one execution needs besides the program text
pub struct SandboxEnv {
    /// Globals after file-proxy installation
    pub globals: Map<String, Value>,
    pub files: Arc<FileProxies>,
    pub control: ExecutionControl,
    pub timeout_ms: u64,
}

/// What the script did
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptResult {
    /// The script returned; `undefined` is reported as `null`
    Returned(Value),
    /// The script (or a proxy accessor it called) threw
    Failed { stack: String },
}

/// Raw result of a sandbox run, before stack remapping
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutcome {
    pub result: ScriptResult,
    pub logs: Vec<LogRecord>,
}

type InterruptHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ControlInner {
    interrupted: AtomicBool,
    hook: Mutex<Option<InterruptHook>>,
}

/// One-shot interrupt flag shared between the pool and a running execution.
///
/// The sandbox registers a hook (for V8, `terminate_execution`) for as long
/// as its interpreter is alive; blocking file reads poll the flag.
#[derive(Clone, Default)]
pub struct ExecutionControl {
    inner: Arc<ControlInner>,
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt the execution. Only the first call has an effect.
    pub fn interrupt(&self) {
        if self.inner.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = self.inner.hook.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hook) = hook.as_ref() {
            hook();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Install the interrupt hook; it runs immediately if the interrupt already happened
    pub fn set_interrupt_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        let mut slot = self.inner.hook.lock().unwrap_or_else(|e| e.into_inner());
        let hook: InterruptHook = Box::new(hook);
        if self.is_interrupted() {
            hook();
        }
        *slot = Some(hook);
    }

    /// Remove the hook before the interpreter it targets goes away
    pub fn clear_interrupt_hook(&self) {
        self.inner
            .hook
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}
