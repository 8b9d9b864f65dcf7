//! Scatter-gather against three in-process shards, one of which never answers.

use shard_cursors::config::{EstablishConfig, ExecutorConfig};
use shard_cursors::error::ErrorCode;
use shard_cursors::testing::{HostScript, TestHarness};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("shard_cursors=debug,info")
        .init();

    let harness = TestHarness::with_config(
        ExecutorConfig::new().with_request_timeout(Duration::from_millis(200)),
        EstablishConfig::new()
            .with_max_attempts(2)
            .with_retry_backoff(Duration::from_millis(20)),
    );

    harness.cluster.add_shard("shard1", HostScript::cursor(1001));
    harness
        .cluster
        .add_shard("shard2", HostScript::cursor(2002).with_delay(Duration::from_secs(5)));
    harness.cluster.add_shard(
        "shard3",
        HostScript::cursor(3003).with_delay(Duration::from_millis(30)),
    );

    let establisher = harness.establisher();
    let targets = || harness.targets(&["shard1", "shard2", "shard3"]);

    println!("--- Partial results allowed ---");
    let cursors = establisher
        .establish(&harness.namespace, targets(), true)
        .await?;
    for cursor in &cursors {
        println!(
            "  {} -> cursor {} on {}",
            cursor.shard_id, cursor.cursor_id, cursor.host
        );
    }

    println!("\n--- Partial results not allowed ---");
    match establisher
        .establish(&harness.namespace, targets(), false)
        .await
    {
        Ok(cursors) => println!("  Unexpectedly established {} cursors", cursors.len()),
        Err(e) => println!("  Failed: {}", e),
    }

    harness.cluster.add_shard(
        "shard2",
        HostScript::error_reply(ErrorCode::NamespaceNotFound, "ns test.users not found"),
    );
    let establisher = harness.establisher();

    println!("\n--- Non-retriable shard error ---");
    if let Err(e) = establisher
        .establish(&harness.namespace, targets(), true)
        .await
    {
        println!("  Failed: {}", e);
    }

    // Close commands are fire-and-forget
    harness
        .cluster
        .wait_for_kill_cursors(4, Duration::from_secs(1))
        .await;
    for (host, _, cmd) in harness.cluster.kill_cursors() {
        println!("  killCursors {:?} sent to {}", cmd.cursor_ids, host);
    }

    println!("\n--- Metrics ---");
    print!("{}", establisher.metrics().to_prometheus());

    Ok(())
}
