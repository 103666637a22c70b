//! Scriptbox Sandbox - pooled execution of untrusted scripts
//!
//! Runs caller-supplied JavaScript on a bounded pool of V8 workers. Each
//! script sees a caller-defined set of globals, a captured `console`, library
//! bindings, and lazily fetched file contents. Results come back as a
//! structured envelope with stack traces mapped onto the caller's own lines.

pub mod bindings;
pub mod config;
pub mod error;
pub mod files;
pub mod limits;
pub mod normalize;
pub mod pool;
pub mod program;
pub mod runtime;
pub mod service;

pub use bindings::{BindingExtractor, EvaluationPair, IdentifierBindingExtractor};
pub use config::{FileServerConfig, PoolConfig, SandboxConfig, ScriptboxConfig};
pub use error::{BindingError, ConfigError, FetchError, PoolError, SandboxError, ServiceError};
pub use files::{ContentMode, FileFetcher, FileSource, HttpFileFetcher, LocalFileFetcher};
pub use limits::ResourceLimits;
pub use normalize::{clean_stack, ResultNormalizer};
pub use pool::{PoolMetrics, WorkerPool, WorkerState};
pub use program::{LibraryBinding, SandboxProgram, SandboxProgramBuilder};
pub use runtime::{ExecutionControl, ExecutionSandbox, RawOutcome, SandboxEnv, ScriptResult, V8Sandbox};
pub use service::ExecutionService;

/// Result type for sandbox-level operations
pub type Result<T> = std::result::Result<T, SandboxError>;
