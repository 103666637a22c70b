//! V8 JavaScript sandbox using deno_core

mod ops;

use self::ops::{ContextGlobals, LogBuffer, Settlement};
use super::{ExecutionSandbox, RawOutcome, SandboxEnv, ScriptResult};
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::program::{SandboxProgram, BOOTSTRAP_NAME, PROGRAM_NAME};
use async_trait::async_trait;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;

/// V8 sandbox; every run gets a fresh isolate
pub struct V8Sandbox {
    limits: ResourceLimits,
}

impl V8Sandbox {
    /// Create a V8 sandbox with default resource limits
    pub fn new() -> Self {
        Self::with_limits(ResourceLimits::default())
    }

    /// Create a V8 sandbox with custom resource limits
    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn create_runtime(&self) -> JsRuntime {
        let create_params = v8::CreateParams::default().heap_limits(0, self.limits.max_heap_bytes);
        JsRuntime::new(RuntimeOptions {
            extensions: vec![ops::sandbox_extension()],
            create_params: Some(create_params),
            ..Default::default()
        })
    }
}

impl Default for V8Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution and grants 1MB so the termination can propagate
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` is the `HeapLimitState` boxed in `V8Sandbox::run`, which
    // removes this callback before the box is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

#[async_trait(?Send)]
impl ExecutionSandbox for V8Sandbox {
    async fn run(&self, program: &SandboxProgram, env: SandboxEnv) -> Result<RawOutcome, SandboxError> {
        let SandboxEnv {
            globals,
            files,
            control,
            timeout_ms,
        } = env;

        let mut runtime = self.create_runtime();
        {
            let state = runtime.op_state();
            let mut state = state.borrow_mut();
            state.put(ContextGlobals(globals));
            state.put(LogBuffer::default());
            state.put(files);
        }

        let heap_state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
        );

        let interrupt_handle = runtime.v8_isolate().thread_safe_handle();
        control.set_interrupt_hook(move || {
            interrupt_handle.terminate_execution();
        });

        // Backstop for CPU-bound scripts in case nobody interrupts us
        let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog_timed_out = Arc::clone(&timed_out);
        let deadline = self.limits.watchdog_timeout(timeout_ms);
        let (cancel_tx, cancel_rx) = channel::<()>();
        let watchdog = std::thread::Builder::new()
            .name("scriptbox-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(deadline) {
                    watchdog_timed_out.store(true, Ordering::SeqCst);
                    watchdog_handle.terminate_execution();
                }
            })
            .map_err(|e| SandboxError::Bootstrap(format!("failed to start watchdog: {}", e)))?;

        tracing::debug!(
            line_offset = program.line_offset(),
            user_lines = program.user_lines(),
            "Executing program"
        );

        let bootstrap = runtime
            .execute_script(BOOTSTRAP_NAME, program.bootstrap().to_string())
            .map(|_| ())
            .map_err(|e| e.to_string());

        // A throw at the program's top level outranks any settlement
        let mut script_error = None;
        let mut loop_error = None;
        if bootstrap.is_ok() {
            match runtime.execute_script(PROGRAM_NAME, program.text().to_string()) {
                Ok(_) => {
                    match tokio::time::timeout(
                        deadline,
                        runtime.run_event_loop(PollEventLoopOptions::default()),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => loop_error = Some(e.to_string()),
                        Err(_) => timed_out.store(true, Ordering::SeqCst),
                    }
                }
                Err(e) => script_error = Some(e.to_string()),
            }
        }

        control.clear_interrupt_hook();
        let _ = cancel_tx.send(());
        let _ = watchdog.join();
        runtime
            .v8_isolate()
            .remove_near_heap_limit_callback(near_heap_limit_callback, 0);

        if heap_state.triggered.load(Ordering::SeqCst) {
            return Err(SandboxError::HeapLimitExceeded);
        }
        if control.is_interrupted() {
            return Err(SandboxError::Interrupted);
        }
        if timed_out.load(Ordering::SeqCst) {
            return Err(SandboxError::Timeout { timeout_ms });
        }
        if let Err(error) = bootstrap {
            return Err(SandboxError::Bootstrap(error));
        }

        let (settlement, logs) = {
            let state = runtime.op_state();
            let mut state = state.borrow_mut();
            let logs = state.try_take::<LogBuffer>().unwrap_or_default().0;
            (state.try_take::<Settlement>(), logs)
        };

        let result = match (script_error, settlement, loop_error) {
            // Syntax errors and throws outside the user's function
            (Some(stack), _, _) => ScriptResult::Failed { stack },
            (None, Some(Settlement::Output(json)), _) => {
                ScriptResult::Returned(serde_json::from_str::<Value>(&json)?)
            }
            (None, Some(Settlement::Error(stack)), _) => ScriptResult::Failed { stack },
            (None, None, Some(stack)) => ScriptResult::Failed { stack },
            (None, None, None) => return Err(SandboxError::NoResult),
        };

        Ok(RawOutcome { result, logs })
    }

    fn name(&self) -> &str {
        "v8"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{FileFetcher, FileProxies};
    use crate::program::SandboxProgramBuilder;
    use crate::runtime::ExecutionControl;
    use crate::error::FetchError;
    use bytes::Bytes;
    use scriptbox_common::{ExecutionRequest, LogLevel};
    use std::time::Duration;

    struct StaticFetcher;

    #[async_trait::async_trait]
    impl FileFetcher for StaticFetcher {
        async fn fetch(&self, location: &str) -> Result<Bytes, FetchError> {
            Ok(Bytes::from(format!("contents of {}", location)))
        }

        fn name(&self) -> &str {
            "static"
        }
    }

    async fn run(request: ExecutionRequest) -> Result<RawOutcome, SandboxError> {
        let built = SandboxProgramBuilder::default().build(&request)?;
        let control = ExecutionControl::new();
        let files = Arc::new(FileProxies::new(
            built.files.locations(),
            Arc::new(StaticFetcher),
            tokio::runtime::Handle::current(),
            Duration::from_millis(10),
            control.clone(),
        ));
        let env = SandboxEnv {
            globals: built.globals,
            files,
            control,
            timeout_ms: request.timeout_ms,
        };
        V8Sandbox::new().run(&built.program, env).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_returns_value() {
        let outcome = run(ExecutionRequest::new("return 1 + 1;", 5000)).await.unwrap();
        assert_eq!(outcome.result, ScriptResult::Returned(serde_json::json!(2)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_undefined_is_null() {
        let outcome = run(ExecutionRequest::new("const x = 1;", 5000)).await.unwrap();
        assert_eq!(outcome.result, ScriptResult::Returned(Value::Null));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_throw_reports_program_frame() {
        let request = ExecutionRequest::new("const a = 1;\nthrow new Error(\"x\");", 5000);
        let built = SandboxProgramBuilder::default().build(&request).unwrap();
        let offset = built.program.line_offset();

        let outcome = run(request).await.unwrap();
        match outcome.result {
            ScriptResult::Failed { stack } => {
                assert!(stack.contains("Error: x"), "{stack}");
                assert!(stack.contains(&format!("{}:{}:", PROGRAM_NAME, offset + 2)), "{stack}");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_console_is_captured() {
        let request = ExecutionRequest::new(
            "console.log(\"a\", { b: 1 });\nconsole.warn(\"w\");\nreturn null;",
            5000,
        );
        let outcome = run(request).await.unwrap();
        assert_eq!(outcome.logs.len(), 2);
        assert_eq!(outcome.logs[0].level, LogLevel::Info);
        assert_eq!(outcome.logs[0].message, "\"a\"\n{\n  \"b\": 1\n}");
        assert_eq!(outcome.logs[1].level, LogLevel::Warn);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_globals_are_visible() {
        let mut request = ExecutionRequest::new("return answer * 2;", 5000);
        request.context.globals.insert("answer".into(), serde_json::json!(21));
        let outcome = run(request).await.unwrap();
        assert_eq!(outcome.result, ScriptResult::Returned(serde_json::json!(42)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_accessors() {
        let request = ExecutionRequest::new(
            "const a = Upload.file.readContents(\"text\");\nconst b = await Upload.file.readContentsAsync();\nreturn [a, b];",
            5000,
        )
        .with_file("Upload.file", "report.txt");
        let outcome = run(request).await.unwrap();
        assert_eq!(
            outcome.result,
            ScriptResult::Returned(serde_json::json!([
                "contents of report.txt",
                "contents of report.txt"
            ]))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deno_namespace_is_hidden() {
        let outcome = run(ExecutionRequest::new("return typeof Deno;", 5000)).await.unwrap();
        assert_eq!(outcome.result, ScriptResult::Returned(serde_json::json!("undefined")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scaffolding_is_out_of_reach() {
        let request = ExecutionRequest::new(
            "return [typeof __sbxOps, typeof __sbxDescribe, typeof __sbxFiles, typeof __sbxRun, typeof ops, typeof setOutput];",
            5000,
        );
        let outcome = run(request).await.unwrap();
        assert_eq!(
            outcome.result,
            ScriptResult::Returned(serde_json::json!([
                "undefined", "undefined", "undefined", "undefined", "undefined", "undefined"
            ]))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_throw_cannot_be_masked_by_early_settlement() {
        let request = ExecutionRequest::new(
            concat!(
                "try { __sbxOps.op_sbx_set_output('\"forged\"'); } catch (_) {}\n",
                "try { __sbxRun(async () => 'forged'); } catch (_) {}\n",
                "throw new Error('real failure');"
            ),
            5000,
        );
        let outcome = run(request).await.unwrap();
        match outcome.result {
            ScriptResult::Failed { stack } => assert!(stack.contains("real failure"), "{stack}"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_console_falls_back_to_string_form() {
        let request = ExecutionRequest::new(
            "const o = {};\no.self = o;\nconsole.log(o, 10n, 'ok');\nreturn null;",
            5000,
        );
        let outcome = run(request).await.unwrap();
        assert_eq!(outcome.logs.len(), 1);
        assert_eq!(outcome.logs[0].level, LogLevel::Info);
        assert_eq!(outcome.logs[0].message, "[object Object]\n10\n\"ok\"");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_globals_shadowing_builtins_keep_scaffolding_working() {
        let mut request = ExecutionRequest::new(
            "console.log({ n: 1 });\nreturn { shadowed: JSON.fake, s: String };",
            5000,
        );
        request.context.globals.insert("JSON".into(), serde_json::json!({ "fake": true }));
        request.context.globals.insert("String".into(), serde_json::json!("text"));
        let outcome = run(request).await.unwrap();
        assert_eq!(
            outcome.result,
            ScriptResult::Returned(serde_json::json!({ "shadowed": true, "s": "text" }))
        );
        assert_eq!(outcome.logs[0].message, "{\n  \"n\": 1\n}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_infinite_loop_hits_watchdog() {
        let sandbox = V8Sandbox::with_limits(ResourceLimits {
            watchdog_grace_ms: 0,
            ..ResourceLimits::default()
        });
        let request = ExecutionRequest::new("while (true) {}", 100);
        let built = SandboxProgramBuilder::default().build(&request).unwrap();
        let control = ExecutionControl::new();
        let env = SandboxEnv {
            globals: built.globals,
            files: Arc::new(FileProxies::new(
                Vec::new(),
                Arc::new(StaticFetcher),
                tokio::runtime::Handle::current(),
                Duration::from_millis(10),
                control.clone(),
            )),
            control,
            timeout_ms: 100,
        };
        let err = sandbox.run(&built.program, env).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { timeout_ms: 100 }));
    }
}
