//! Resource limits configuration for sandboxed execution

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-execution resource limits applied inside a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// V8 heap limit in bytes
    pub max_heap_bytes: usize,

    /// Wake-up interval of a blocking file read while it waits for the fetch
    pub poll_interval_ms: u64,

    /// Extra time the interpreter watchdog grants beyond the request timeout.
    ///
    /// The pool's cancellation normally fires first; the watchdog only catches
    /// executions the pool failed to abort.
    pub watchdog_grace_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_heap_bytes: 128 * 1024 * 1024, // 128 MB
            poll_interval_ms: 100,
            watchdog_grace_ms: 500,
        }
    }
}

impl ResourceLimits {
    /// Create strict limits for untrusted code
    pub fn strict() -> Self {
        Self {
            max_heap_bytes: 32 * 1024 * 1024, // 32 MB
            poll_interval_ms: 50,
            watchdog_grace_ms: 100,
        }
    }

    /// Create permissive limits for trusted code
    pub fn permissive() -> Self {
        Self {
            max_heap_bytes: 512 * 1024 * 1024, // 512 MB
            poll_interval_ms: 100,
            watchdog_grace_ms: 2_000,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Deadline of the interpreter watchdog for a request with the given budget
    pub fn watchdog_timeout(&self, timeout_ms: u64) -> Duration {
        Duration::from_millis(timeout_ms.saturating_add(self.watchdog_grace_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.max_heap_bytes, 128 * 1024 * 1024);
        assert_eq!(limits.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_strict_limits() {
        let limits = ResourceLimits::strict();
        assert_eq!(limits.max_heap_bytes, 32 * 1024 * 1024);
        assert_eq!(limits.watchdog_timeout(10), Duration::from_millis(110));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let limits = ResourceLimits {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(limits.poll_interval(), Duration::from_millis(1));
    }
}
