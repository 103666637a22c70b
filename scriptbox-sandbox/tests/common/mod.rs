//! Shared helpers for the V8-backed integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use scriptbox_sandbox::{
    ExecutionService, FetchError, FileFetcher, FileSource, PoolConfig, V8Sandbox, WorkerPool,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("scriptbox_sandbox=debug,scriptbox::script=info")
        .with_test_writer()
        .try_init();
}

/// In-memory fetcher that counts calls and tracks how many fetches overlap
#[derive(Default)]
pub struct MemoryFetcher {
    files: HashMap<String, Vec<u8>>,
    delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, location: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(location.to_string(), contents.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileFetcher for MemoryFetcher {
    async fn fetch(&self, location: &str) -> Result<Bytes, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.files
            .get(location)
            .map(|bytes| Bytes::from(bytes.clone()))
            .ok_or_else(|| FetchError::Status {
                location: location.to_string(),
                status: 404,
            })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// V8-backed service whose remote and local fetches both go to `fetcher`
pub async fn v8_service(size: usize, fetcher: Arc<MemoryFetcher>) -> ExecutionService {
    let files = FileSource::new(fetcher.clone(), fetcher);
    let pool = WorkerPool::new(
        PoolConfig {
            size,
            max_uses: 100,
        },
        Arc::new(V8Sandbox::new()),
        files,
    )
    .with_poll_interval(Duration::from_millis(10));

    let service = ExecutionService::new(pool);
    service.init().await.expect("pool should configure");
    service
}
