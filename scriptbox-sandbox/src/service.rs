//! Execution service - main entry point

use crate::bindings::{BindingExtractor, EvaluationPair, IdentifierBindingExtractor};
use crate::config::ScriptboxConfig;
use crate::error::{BindingError, ConfigError, PoolError, ServiceError};
use crate::files::{FileSource, HttpFileFetcher, LocalFileFetcher};
use crate::pool::WorkerPool;
use crate::runtime::{ExecutionSandbox, V8Sandbox};
use scriptbox_common::{ExecutionEnvelope, ExecutionRequest};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Aborts the timeout timer however `execute` returns
struct TimerGuard(JoinHandle<()>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs scripts on the worker pool and enforces their timeouts
pub struct ExecutionService {
    pool: Arc<WorkerPool>,
    bindings: Arc<dyn BindingExtractor>,
    default_timeout_ms: u64,
}

impl ExecutionService {
    /// Create a service over an existing pool
    pub fn new(pool: WorkerPool) -> Self {
        Self::with_extractor(pool, IdentifierBindingExtractor)
    }

    /// Create a service with a custom binding extractor
    pub fn with_extractor(pool: WorkerPool, bindings: impl BindingExtractor + 'static) -> Self {
        Self {
            pool: Arc::new(pool),
            bindings: Arc::new(bindings),
            default_timeout_ms: 30_000,
        }
    }

    /// Build the V8 pool, fetchers and libraries described by `config`
    pub fn from_config(config: &ScriptboxConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let remote = HttpFileFetcher::new(&config.file_server)?;
        let local = LocalFileFetcher::new(&config.sandbox.working_dir);
        let files = FileSource::new(Arc::new(remote), Arc::new(local));
        let limits = config.sandbox.limits.clone();
        let sandbox: Arc<dyn ExecutionSandbox> = Arc::new(V8Sandbox::with_limits(limits.clone()));

        let pool = WorkerPool::new(config.pool.clone(), sandbox, files)
            .with_libraries(config.sandbox.libraries.clone())
            .with_poll_interval(limits.poll_interval());

        Ok(Self::new(pool).with_default_timeout(config.sandbox.default_timeout_ms))
    }

    /// Timeout applied to requests that carry `timeout_ms = 0`
    pub fn with_default_timeout(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Configure the worker pool
    pub async fn init(&self) -> Result<(), ServiceError> {
        self.pool.configure().await.map_err(ServiceError::PoolState)
    }

    /// Shut the worker pool down
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Execute a script and decode its envelope.
    ///
    /// Script errors come back inside the envelope; only timeouts and pool
    /// state problems are returned as errors.
    #[tracing::instrument(skip_all, fields(code_len = request.code.len(), timeout_ms = tracing::field::Empty))]
    pub async fn execute(
        &self,
        mut request: ExecutionRequest,
    ) -> Result<ExecutionEnvelope, ServiceError> {
        if request.timeout_ms == 0 {
            request.timeout_ms = self.default_timeout_ms;
        }
        let timeout_ms = request.timeout_ms;
        tracing::Span::current().record("timeout_ms", timeout_ms);

        let token = CancellationToken::new();
        let timer = token.clone();
        let _timer = TimerGuard(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            timer.cancel();
        }));

        let encoded = match self.pool.run(request, token).await {
            Ok(encoded) => encoded,
            Err(PoolError::Aborted) => {
                tracing::warn!(timeout_ms, "Execution timed out");
                return Err(ServiceError::Timeout { timeout_ms });
            }
            Err(e) => return Err(ServiceError::PoolState(e)),
        };

        let envelope = ExecutionEnvelope::from_json_str(&encoded)?;
        tracing::debug!(
            success = envelope.success(),
            log_records = envelope.log.len(),
            "Execution completed"
        );
        Ok(envelope)
    }

    /// Which of `candidates` the script references, with their values
    pub async fn evaluate_bindings(
        &self,
        code: &str,
        candidates: &BTreeSet<String>,
        data_context: &Map<String, Value>,
    ) -> Result<Vec<EvaluationPair>, BindingError> {
        self.bindings.extract(code, candidates, data_context).await
    }
}
