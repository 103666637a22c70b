//! Execution requests

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique execution identifier, used to correlate logs across the pool boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub uuid::Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bindings and flags visible to one execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Global variables installed into the script's scope
    #[serde(default)]
    pub globals: Map<String, Value>,

    /// Read file contents from the worker's local disk instead of the file server.
    ///
    /// Absent means remote fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_files: Option<bool>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a global binding
    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    /// Set the local-disk read flag
    pub fn with_local_files(mut self, enabled: bool) -> Self {
        self.local_files = Some(enabled);
        self
    }

    /// Whether file proxies should read from local disk
    pub fn reads_local_files(&self) -> bool {
        self.local_files.unwrap_or(false)
    }
}

/// A declared external file, exposed to the script as a lazy proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    /// Dotted path into the globals where the proxy is installed (e.g. `Step1.files.0`)
    pub tree_path: String,

    /// Opaque token identifying the bytes on the file server
    pub location: String,
}

impl FileReference {
    pub fn new(tree_path: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            tree_path: tree_path.into(),
            location: location.into(),
        }
    }
}

/// Request to execute a script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Global context for the script
    #[serde(default)]
    pub context: ExecutionContext,

    /// The script body; it runs inside an async function, so `return` and `await` are allowed
    pub code: String,

    /// File references, in declaration order
    #[serde(default)]
    pub files: Vec<FileReference>,

    /// Wall-clock budget in milliseconds
    pub timeout_ms: u64,
}

impl ExecutionRequest {
    /// Create a request with an empty context and no files
    pub fn new(code: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            context: ExecutionContext::default(),
            code: code.into(),
            files: Vec::new(),
            timeout_ms,
        }
    }

    /// Set the execution context
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Declare a file reference
    pub fn with_file(mut self, tree_path: impl Into<String>, location: impl Into<String>) -> Self {
        self.files.push(FileReference::new(tree_path, location));
        self
    }
}
