//! Configuration for the pool, the sandbox and the file server

use crate::error::ConfigError;
use crate::limits::ResourceLimits;
use crate::program::LibraryBinding;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptboxConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub file_server: FileServerConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of workers kept warm; also the concurrency bound
    pub size: usize,
    /// Recycle a worker after this many executions
    pub max_uses: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            max_uses: 500,
        }
    }
}

/// Sandbox configuration shared by all workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory holding files staged for local reads
    pub working_dir: PathBuf,
    /// Timeout used by callers that do not pick their own
    pub default_timeout_ms: u64,
    pub limits: ResourceLimits,
    /// Library bindings injected ahead of every script
    pub libraries: Vec<LibraryBinding>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            working_dir: std::env::temp_dir().join("scriptbox"),
            default_timeout_ms: 30_000,
            limits: ResourceLimits::default(),
            libraries: Vec::new(),
        }
    }
}

/// Content server used by remote file proxies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileServerConfig {
    pub base_url: String,
    pub agent_key: String,
    pub agent_key_header: String,
}

impl Default for FileServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8020/v1/files".to_string(),
            agent_key: String::new(),
            agent_key_header: "x-agent-key".to_string(),
        }
    }
}

impl ScriptboxConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;

        tracing::debug!(
            path = %path.display(),
            pool_size = config.pool.size,
            libraries = config.sandbox.libraries.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Reject values the pool or fetchers cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.size == 0 {
            return Err(ConfigError::Invalid("pool.size must be at least 1".into()));
        }
        if self.pool.max_uses == 0 {
            return Err(ConfigError::Invalid("pool.max_uses must be at least 1".into()));
        }
        url::Url::parse(&self.file_server.base_url).map_err(|e| {
            ConfigError::Invalid(format!(
                "file_server.base_url `{}` is not a valid URL: {}",
                self.file_server.base_url, e
            ))
        })?;
        reqwest::header::HeaderName::from_bytes(self.file_server.agent_key_header.as_bytes())
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "file_server.agent_key_header `{}` is not a valid header name",
                    self.file_server.agent_key_header
                ))
            })?;
        for library in &self.sandbox.libraries {
            if !crate::program::is_identifier(&library.name) {
                return Err(ConfigError::Invalid(format!(
                    "library name `{}` is not a valid identifier",
                    library.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ScriptboxConfig::from_toml("").unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.file_server.agent_key_header, "x-agent-key");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config = ScriptboxConfig::from_toml(
            r#"
            [pool]
            size = 2

            [sandbox]
            default_timeout_ms = 1000

            [sandbox.limits]
            poll_interval_ms = 25

            [[sandbox.libraries]]
            name = "double"
            source = "(x) => x * 2"

            [file_server]
            base_url = "http://files.internal/v2/files"
            agent_key = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.size, 2);
        assert_eq!(config.pool.max_uses, PoolConfig::default().max_uses);
        assert_eq!(config.sandbox.default_timeout_ms, 1000);
        assert_eq!(config.sandbox.limits.poll_interval_ms, 25);
        assert_eq!(config.sandbox.libraries[0].name, "double");
        assert_eq!(config.file_server.agent_key, "secret");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let mut config = ScriptboxConfig::default();
        config.pool.size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_reserved_library_names() {
        for name in ["class", "return", "undefined"] {
            let mut config = ScriptboxConfig::default();
            config.sandbox.libraries = vec![LibraryBinding::new(name, "{}")];
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "library `{name}` should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut config = ScriptboxConfig::default();
        config.file_server.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ScriptboxConfig::load("/nonexistent/scriptbox.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scriptbox.toml");
        std::fs::write(&path, "[pool]\nsize = 3\n").unwrap();
        let config = ScriptboxConfig::load(&path).unwrap();
        assert_eq!(config.pool.size, 3);
    }
}
