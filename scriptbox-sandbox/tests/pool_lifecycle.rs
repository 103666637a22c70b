//! Pool bounds and lifecycle with real V8 workers

mod common;

use common::{setup_test_logging, v8_service, MemoryFetcher};
use scriptbox_common::ExecutionRequest;
use scriptbox_sandbox::{PoolError, ServiceError};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_at_most_pool_size_scripts_run_at_once() {
    setup_test_logging();
    let fetcher = Arc::new(
        MemoryFetcher::new()
            .with_file("slow", "done")
            .with_delay(Duration::from_millis(50)),
    );
    let service = Arc::new(v8_service(2, fetcher.clone()).await);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let request = ExecutionRequest::new("return await F.readContentsAsync();", 10_000)
                .with_file("F", "slow");
            service.execute(request).await
        }));
    }
    for handle in handles {
        let envelope = handle.await.unwrap().unwrap();
        assert_eq!(envelope.output, Some(json!("done")));
    }

    assert_eq!(fetcher.calls(), 6);
    assert_eq!(fetcher.peak_in_flight.load(Ordering::SeqCst), 2);
    service.shutdown().await;
}

#[tokio::test]
async fn test_configure_twice_keeps_worker_count() {
    setup_test_logging();
    let service = v8_service(3, Arc::new(MemoryFetcher::new())).await;
    service.init().await.unwrap();

    assert_eq!(service.pool().idle_workers(), 3);
    assert_eq!(service.pool().metrics().spawned.load(Ordering::Relaxed), 3);
    service.shutdown().await;
}

#[tokio::test]
async fn test_execute_after_shutdown_is_pool_state_error() {
    setup_test_logging();
    let service = v8_service(1, Arc::new(MemoryFetcher::new())).await;
    service.shutdown().await;

    let err = service
        .execute(ExecutionRequest::new("return 1;", 1000))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::PoolState(PoolError::ShutDown)));
}

#[tokio::test]
async fn test_timeout_does_not_stall_other_requests() {
    setup_test_logging();
    let service = Arc::new(v8_service(2, Arc::new(MemoryFetcher::new())).await);

    let spinning = Arc::clone(&service);
    let spin = tokio::spawn(async move {
        spinning
            .execute(ExecutionRequest::new("while (true) {}", 200))
            .await
    });

    let envelope = service
        .execute(ExecutionRequest::new("return 'quick';", 5000))
        .await
        .unwrap();
    assert_eq!(envelope.output, Some(json!("quick")));

    let err = spin.await.unwrap().unwrap_err();
    assert!(matches!(err, ServiceError::Timeout { timeout_ms: 200 }));
    service.shutdown().await;
}

#[tokio::test]
async fn test_blocking_read_is_interrupted_by_timeout() {
    setup_test_logging();
    let fetcher = Arc::new(
        MemoryFetcher::new()
            .with_file("stuck", "never seen")
            .with_delay(Duration::from_secs(30)),
    );
    let service = v8_service(1, fetcher).await;

    let request = ExecutionRequest::new("return F.readContents();", 50).with_file("F", "stuck");
    let err = service.execute(request).await.unwrap_err();
    assert!(matches!(err, ServiceError::Timeout { timeout_ms: 50 }));

    // Shutdown waits for the worker thread, which must have left the blocking read
    tokio::time::timeout(Duration::from_secs(5), service.shutdown())
        .await
        .expect("worker should exit promptly");
}
