use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use corral::{
    handler_fn, spawn_heartbeat_publisher, spawn_signal_listener, CorralConfig, EnqueueOptions,
    HealthRegistry, HeartbeatInfo, JobContext, JobId, KeySpace, NodeId, RedisStore,
    ShutdownToken, SupervisorBuilder, TaskQueue, TaskRegistry,
};

/// Supervised worker pool over a Redis-backed task queue.
///
/// Configuration is read from the environment (WORKERS, WORKER_TIMEOUT,
/// GRACEFUL_TIMEOUT, MAX_REQUESTS, QUEUES, REDIS_URL, NODE_ID, ...).
#[derive(Parser, Debug)]
#[command(name = "corral", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker pool on this node until signalled
    Run,
    /// Enqueue a job and print its id
    Enqueue {
        /// Registered task name (`echo` or `sleep`)
        task: String,
        /// JSON payload
        #[arg(default_value = "null")]
        payload: String,
        #[arg(long, default_value_t = corral::DEFAULT_QUEUE.to_string())]
        queue: String,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        /// Seconds before a started job is reaped
        #[arg(long)]
        timeout: Option<u64>,
        /// Seconds before the job becomes eligible
        #[arg(long, default_value_t = 0)]
        delay: u64,
        /// Seconds a finished record is kept
        #[arg(long, default_value_t = corral::DEFAULT_RESULT_TTL_SECS)]
        result_ttl: u64,
    },
    /// Print a job record as JSON
    Status { job_id: JobId },
    /// Cancel a queued job, or flag a started one
    Cancel { job_id: JobId },
    /// Print the cluster health view as JSON
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = CorralConfig::from_env().context("failed to load configuration")?;

    let store = Arc::new(
        RedisStore::connect(&config.store.redis_url)
            .await
            .with_context(|| format!("failed to connect to {}", config.store.redis_url))?,
    );
    let keys = KeySpace::new(config.store.namespace.clone());

    match cli.command {
        Command::Run => run(config, store, keys).await,
        Command::Enqueue {
            task,
            payload,
            queue,
            max_retries,
            timeout,
            delay,
            result_ttl,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;
            let mut opts = EnqueueOptions::default()
                .with_queue(queue)
                .with_max_retries(max_retries)
                .with_delay(delay)
                .with_result_ttl(result_ttl);
            if let Some(secs) = timeout {
                opts = opts.with_timeout(secs);
            }
            let job_id = client(&config, store, keys).enqueue(&task, payload, opts).await?;
            println!("{job_id}");
            Ok(())
        }
        Command::Status { job_id } => {
            let job = client(&config, store, keys).status(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::Cancel { job_id } => {
            let cancelled = client(&config, store, keys).cancel(job_id).await?;
            println!("{}", json!({ "job_id": job_id, "cancelled": cancelled }));
            Ok(())
        }
        Command::Health => {
            let registry = HealthRegistry::new(store, config.health.clone()).with_keys(keys);
            let health = registry.aggregate_health().await?;
            println!("{}", serde_json::to_string_pretty(&health.to_json())?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Built-in handlers. Producers and workers must share the same registry, so
/// the client commands use it too.
fn builtin_registry() -> TaskRegistry {
    TaskRegistry::new()
        .with_handler("echo", handler_fn(|_ctx, payload| async move { Ok(payload) }))
        .with_handler("sleep", handler_fn(sleep_task))
}

/// Sleeps for `payload.seconds` (or a bare number), heartbeating once a
/// second and stopping early if cancellation is requested.
async fn sleep_task(ctx: JobContext, payload: Value) -> Result<Value> {
    let seconds = payload
        .get("seconds")
        .and_then(Value::as_f64)
        .or_else(|| payload.as_f64())
        .context("sleep expects {\"seconds\": n} or a number")?;

    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    while Instant::now() < deadline {
        if ctx.is_cancel_requested().await {
            return Ok(json!({ "slept": false, "cancelled": true }));
        }
        ctx.heartbeat();
        tokio::time::sleep_until(deadline.min(Instant::now() + Duration::from_secs(1))).await;
    }
    Ok(json!({ "slept": seconds }))
}

fn client(config: &CorralConfig, store: Arc<RedisStore>, keys: KeySpace) -> TaskQueue<RedisStore> {
    TaskQueue::new(store, Arc::new(builtin_registry()), config.queue.clone()).with_keys(keys)
}

async fn run(config: CorralConfig, store: Arc<RedisStore>, keys: KeySpace) -> Result<()> {
    let node_id: NodeId = config
        .node_id
        .parse()
        .with_context(|| format!("invalid node id {:?}", config.node_id))?;

    let supervisor = SupervisorBuilder::new(config.supervisor.clone())
        .with_store(Arc::clone(&store))
        .with_registry(Arc::new(builtin_registry()))
        .with_queue_config(config.queue.clone())
        .with_keys(keys.clone())
        .build()?;
    let (handle, join) = supervisor.spawn();
    let signals = spawn_signal_listener(handle.clone())?;

    let health = Arc::new(HealthRegistry::new(store, config.health.clone()).with_keys(keys));
    let shutdown = ShutdownToken::new();
    let started = Instant::now();
    let publisher = spawn_heartbeat_publisher(
        health,
        node_id.clone(),
        move || HeartbeatInfo {
            worker_count: handle.status().ready_count(),
            uptime: started.elapsed(),
        },
        shutdown.clone(),
    );

    info!(node_id = %node_id, "node running");
    let result = join.await.context("supervisor task panicked")?;

    shutdown.cancel();
    if let Err(err) = publisher.await {
        tracing::warn!(error = %err, "heartbeat publisher panicked");
    }
    signals.abort();
    info!(node_id = %node_id, "node stopped");
    result
}
