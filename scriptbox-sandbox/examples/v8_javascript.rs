//! Run a few scripts through the V8 worker pool

use scriptbox_common::{ExecutionContext, ExecutionRequest};
use scriptbox_sandbox::{ExecutionService, ScriptboxConfig};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let service = ExecutionService::from_config(&ScriptboxConfig::default())?;
    service.init().await?;
    println!("=== Scriptbox V8 Pool ===\n");

    println!("Example 1: Return a value");
    execute_and_print(&service, ExecutionRequest::new("return 1 + 1;", 5000)).await?;

    println!("\nExample 2: Globals and console");
    let context = ExecutionContext::new().with_global("Step1", json!({ "rows": [3, 4, 5] }));
    let request = ExecutionRequest::new(
        r#"
        console.log("summing", Step1.rows.length, "rows");
        return Step1.rows.reduce((a, b) => a + b, 0);
        "#,
        5000,
    )
    .with_context(context);
    execute_and_print(&service, request).await?;

    println!("\nExample 3: Await inside the script");
    let request = ExecutionRequest::new(
        "const v = await Promise.resolve(21);\nreturn { doubled: v * 2 };",
        5000,
    );
    execute_and_print(&service, request).await?;

    println!("\nExample 4: Error with a remapped stack");
    let request = ExecutionRequest::new("const x = 1;\nthrow new Error('Test error');", 5000);
    execute_and_print(&service, request).await?;

    service.shutdown().await;
    Ok(())
}

async fn execute_and_print(
    service: &ExecutionService,
    request: ExecutionRequest,
) -> anyhow::Result<()> {
    let envelope = service.execute(request).await?;
    for record in &envelope.log {
        println!("  [{:?}] {}", record.level, record.message);
    }
    match (&envelope.output, &envelope.error) {
        (_, Some(error)) => println!("✗ {}", error),
        (Some(output), None) => println!("✓ {}", output),
        (None, None) => println!("✓ (no output)"),
    }
    Ok(())
}
