//! Error types for the scriptbox sandbox

use thiserror::Error;

/// Failure to retrieve file content for a proxy
#[derive(Debug, Error)]
pub enum FetchError {
    /// The file server answered with a non-success status
    #[error("failed to fetch file `{location}`: server returned status {status}")]
    Status { location: String, status: u16 },

    /// The request never produced a response
    #[error("failed to fetch file `{location}`: {source}")]
    Transport {
        location: String,
        #[source]
        source: reqwest::Error,
    },

    /// The location cannot be mapped onto the sandbox working directory
    #[error("invalid file location `{location}`: {reason}")]
    InvalidLocation { location: String, reason: String },

    /// Reading a staged file from local disk failed
    #[error("failed to read staged file `{location}`: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },

    /// The execution was interrupted while a blocking read was waiting
    #[error("file read for `{location}` interrupted")]
    Interrupted { location: String },

    /// The fetch task ended without delivering a result
    #[error("fetch task for `{location}` was dropped")]
    Dropped { location: String },
}

/// Errors raised by the sandbox itself (not by the user's script)
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The interpreter-level watchdog fired
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The execution was cancelled from outside
    #[error("execution interrupted")]
    Interrupted,

    /// V8 approached its heap limit and was terminated
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// A file reference points somewhere the proxy cannot be installed
    #[error("invalid tree path `{path}`: {reason}")]
    InvalidTreePath { path: String, reason: String },

    /// A context global cannot be defined on the global object
    #[error("invalid global `{name}`: {reason}")]
    InvalidGlobal { name: String, reason: String },

    /// Installing the context or program scaffolding failed
    #[error("sandbox bootstrap failed: {0}")]
    Bootstrap(String),

    /// The program finished without settling a result
    #[error("program finished without producing a result")]
    NoResult,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the worker pool
#[derive(Debug, Error)]
pub enum PoolError {
    /// `run` was called before `configure`
    #[error("worker pool is not configured")]
    NotConfigured,

    /// `run` was called after `shutdown`
    #[error("worker pool is shut down")]
    ShutDown,

    /// The cancellation signal fired before the worker finished
    #[error("execution aborted")]
    Aborted,

    /// A worker thread could not be started
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors surfaced to direct callers of the execution service
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The execution exceeded its wall-clock budget
    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The pool refused the request (not configured, shut down, or unable to spawn)
    #[error(transparent)]
    PoolState(PoolError),

    /// The worker produced an envelope that could not be decoded
    #[error("invalid result envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

/// Failure to extract referenced bindings from script source
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("failed to tokenize script: {0}")]
    Tokenize(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
