//! Result envelope returned by one execution

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a captured console call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse the level name sent by the sandbox console; unknown names map to `Info`
    pub fn from_name(name: &str) -> Self {
        match name {
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// One captured console call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Canonical result of one execution: `output` XOR `error`, plus captured logs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvelope {
    /// Value returned by the script (`null` when it returned `undefined`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Stack trace relative to the caller's script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Console records in call order
    #[serde(default)]
    pub log: Vec<LogRecord>,
}

impl ExecutionEnvelope {
    /// Successful envelope
    pub fn with_output(output: Value, log: Vec<LogRecord>) -> Self {
        Self {
            output: Some(output),
            error: None,
            log,
        }
    }

    /// Failed envelope
    pub fn with_error(error: impl Into<String>, log: Vec<LogRecord>) -> Self {
        Self {
            output: None,
            error: Some(error.into()),
            log,
        }
    }

    /// Check if the script completed without raising
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Encode for transport across the pool boundary
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode an envelope produced by [`ExecutionEnvelope::to_json_string`]
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
