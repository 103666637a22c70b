//! Timeouts reclaim the worker without stalling the pool

use scriptbox_common::ExecutionRequest;
use scriptbox_sandbox::{ExecutionService, ScriptboxConfig};
use std::time::Instant;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = ScriptboxConfig::default();
    config.pool.size = 2;
    let service = ExecutionService::from_config(&config)?;
    service.init().await?;

    let started = Instant::now();
    let spin = service.execute(ExecutionRequest::new("while (true) {}", 200));
    let quick = service.execute(ExecutionRequest::new("return 'still responsive';", 5000));
    let (spin, quick) = tokio::join!(spin, quick);

    match spin {
        Ok(envelope) => println!("Unexpected result: {:?}", envelope),
        Err(e) => println!("Infinite loop: {} ({:?})", e, started.elapsed()),
    }
    println!("Concurrent script: {:?}", quick?.output);

    let after = service
        .execute(ExecutionRequest::new("return 'worker replaced';", 5000))
        .await?;
    println!("After timeout: {:?}", after.output);
    println!("Pool metrics: {:?}", service.pool().metrics());

    service.shutdown().await;
    Ok(())
}
