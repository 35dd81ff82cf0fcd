//! Basic supervisor example with the in-memory store.
//!
//! Starts a pool of three workers, enqueues a mix of succeeding, flaky and
//! delayed jobs, scales the pool, reloads it, and shuts down gracefully.
//!
//! Run with `cargo run --example runtime_basic`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corral::*;
use serde_json::{json, Value};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,corral=debug".into()),
        )
        .init();

    println!("=== Corral Runtime Example ===\n");

    // 1. Register handlers
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let registry = TaskRegistry::new()
        .with_handler(
            "echo",
            handler_fn(|ctx, payload| async move {
                println!("[{}] echo {payload} (attempt {})", ctx.worker_id, ctx.attempt);
                Ok(payload)
            }),
        )
        .with_handler("flaky", {
            let calls = Arc::clone(&flaky_calls);
            handler_fn(move |ctx, _payload: Value| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient failure on attempt {}", ctx.attempt);
                    }
                    Ok(json!("recovered"))
                }
            })
        });
    println!("1. Registered tasks: {:?}\n", registry.task_names());

    // 2. Build and start the supervisor
    let config = SupervisorConfig {
        target_worker_count: 3,
        max_requests: 50,
        max_requests_jitter: 10,
        ..SupervisorConfig::default()
    };
    let queue_config = QueueConfig::default()
        .with_queues(["critical", DEFAULT_QUEUE])
        .with_retry(RetryPolicy::new(100, 1_000));
    let supervisor = SupervisorBuilder::new(config)
        .with_store(Arc::new(MemoryStore::new()))
        .with_registry(Arc::new(registry))
        .with_queue_config(queue_config)
        .build()?;
    let queue = supervisor.queue();
    let (handle, join) = supervisor.spawn();
    let mut events = handle.subscribe();
    println!("2. Supervisor started with 3 workers\n");

    // 3. Enqueue work
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(queue.enqueue("echo", json!({ "n": i }), EnqueueOptions::default()).await?);
    }
    ids.push(
        queue
            .enqueue("echo", json!("urgent"), EnqueueOptions::default().with_queue("critical"))
            .await?,
    );
    ids.push(
        queue
            .enqueue("flaky", Value::Null, EnqueueOptions::default().with_max_retries(3))
            .await?,
    );
    ids.push(
        queue
            .enqueue("echo", json!("later"), EnqueueOptions::default().with_delay(1))
            .await?,
    );
    println!("3. Enqueued {} jobs\n", ids.len());

    match queue.enqueue("missing", Value::Null, EnqueueOptions::default()).await {
        Err(err) => println!("   Rejected as expected: {err}\n"),
        Ok(id) => println!("   Unexpectedly accepted {id}\n"),
    }

    // 4. Wait for every job to settle
    for id in &ids {
        loop {
            let job = queue.status(*id).await?;
            if job.status.is_terminal() {
                println!(
                    "4. {} {} -> {} (retries used: {})",
                    job.task_name, id, job.status, job.retries_used
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // 5. Scale and reload
    handle.scale(ScaleRequest::By(2)).await?;
    handle.reload().await?;
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::ReloadCompleted { generation }) => {
                println!("\n5. Reload to generation {generation} completed");
                break;
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(err) => anyhow::bail!("event stream ended: {err}"),
        }
    }
    let status = handle.status();
    println!(
        "   Target {} workers, {} ready",
        status.target_worker_count,
        status.ready_count()
    );

    let snapshot = queue.snapshot().await?;
    for depth in &snapshot.queues {
        println!(
            "   Queue {}: pending={} scheduled={} started={}",
            depth.name, depth.pending, depth.scheduled, depth.started
        );
    }

    // 6. Graceful shutdown
    handle.graceful_shutdown(Some(Duration::from_secs(5))).await?;
    join.await??;
    println!("\n6. Supervisor stopped");
    println!("\n=== Example Complete ===");

    Ok(())
}
