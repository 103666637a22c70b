//! CLI command implementations

use anyhow::{anyhow, bail, Context, Result};
use scriptbox_common::{ExecutionContext, ExecutionEnvelope, ExecutionRequest, FileReference};
use scriptbox_sandbox::{ExecutionService, ScriptboxConfig, ServiceError};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Arguments of `scriptbox run`
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub script: PathBuf,
    pub globals: Option<PathBuf>,
    pub files: Vec<FileReference>,
    pub timeout_ms: Option<u64>,
    pub local_files: bool,
    pub config: Option<PathBuf>,
}

/// Parse a `tree.path=location` file argument
pub fn parse_file_reference(arg: &str) -> Result<FileReference, String> {
    let (tree_path, location) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected `tree.path=location`, got `{arg}`"))?;
    if tree_path.is_empty() || location.is_empty() {
        return Err(format!("empty tree path or location in `{arg}`"));
    }
    Ok(FileReference::new(tree_path, location))
}

/// Read a JSON object of globals
fn load_globals(path: &Path) -> Result<Map<String, Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read globals file {}", path.display()))?;
    match serde_json::from_str(&content).context("Globals file is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("Globals must be a JSON object, got {}", kind(&other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Assemble the execution request from the command line
pub fn build_request(args: &RunArgs) -> Result<ExecutionRequest> {
    let code = std::fs::read_to_string(&args.script)
        .with_context(|| format!("Failed to read script {}", args.script.display()))?;

    let mut context = ExecutionContext::new();
    if let Some(path) = &args.globals {
        context.globals = load_globals(path)?;
    }
    if args.local_files {
        context = context.with_local_files(true);
    }

    let mut request = ExecutionRequest::new(code, args.timeout_ms.unwrap_or(0)).with_context(context);
    request.files = args.files.clone();
    Ok(request)
}

fn load_config(path: Option<&Path>) -> Result<ScriptboxConfig> {
    match path {
        Some(path) => ScriptboxConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(ScriptboxConfig::default()),
    }
}

/// Exit code for a finished envelope
pub fn exit_code(envelope: &ExecutionEnvelope) -> i32 {
    if envelope.success() {
        0
    } else {
        1
    }
}

/// Run one script and print its envelope as JSON.
///
/// Returns the process exit code: 0 on success, 1 when the script failed,
/// 2 when it timed out.
pub async fn execute_run(args: RunArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    let request = build_request(&args)?;
    debug!(
        files = request.files.len(),
        globals = request.context.globals.len(),
        "Request assembled"
    );

    let service = ExecutionService::from_config(&config).context("Invalid configuration")?;
    service.init().await.context("Failed to start worker pool")?;

    info!(script = %args.script.display(), "Executing script");
    let result = service.execute(request).await;
    service.shutdown().await;

    match result {
        Ok(envelope) => {
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Ok(exit_code(&envelope))
        }
        Err(ServiceError::Timeout { timeout_ms }) => {
            eprintln!("Error: timed out after {timeout_ms}ms");
            Ok(2)
        }
        Err(e) => bail!("Execution failed: {e}"),
    }
}
