//! Corral - a supervised worker pool over a durable task queue.
//!
//! Producers enqueue named tasks with a JSON payload into a shared store.
//! Worker pools on any number of nodes pull those jobs, run the registered
//! handler, and record the outcome. A supervisor keeps each pool at its
//! target size, recycles workers, and reacts to control intents.
//!
//! # Core Concepts
//!
//! - **Store**: The [`JobStore`] trait is the atomic key-value, list and
//!   sorted-set substrate shared by every process. [`MemoryStore`] runs in
//!   process; `RedisStore` is enabled with the `redis` feature.
//!
//! - **Queue**: [`TaskQueue`] implements enqueue, dequeue, completion,
//!   retry with exponential backoff, cancellation, delayed jobs and the
//!   reaping of started jobs that outlived their timeout.
//!
//! - **Registry**: [`TaskRegistry`] maps task names to [`TaskHandler`]s.
//!
//! - **Runtime**: A [`Supervisor`] owns [`Worker`]s and is driven through a
//!   [`SupervisorHandle`] (reload, graceful or immediate shutdown, scale).
//!
//! - **Health**: [`HealthRegistry`] publishes per-node heartbeats with a TTL
//!   and aggregates them into a [`ClusterHealth`] view.
//!
//! - **Events**: [`InProcEventBus`] broadcasts job and supervisor lifecycle
//!   events to in-process subscribers.
//!
//! # Feature Flags
//!
//! - `redis` - Redis-backed [`JobStore`]
//! - `metrics` - Prometheus metrics support
//! - `cli` - the `corral` binary
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use corral::*;
//!
//! let registry = TaskRegistry::new().with_handler(
//!     "echo",
//!     handler_fn(|_ctx, payload| async move { Ok(payload) }),
//! );
//! let supervisor = SupervisorBuilder::new(SupervisorConfig::default())
//!     .with_store(Arc::new(MemoryStore::new()))
//!     .with_registry(Arc::new(registry))
//!     .build()?;
//! let queue = supervisor.queue();
//! let (handle, join) = supervisor.spawn();
//!
//! let id = queue.enqueue("echo", serde_json::json!("hi"), EnqueueOptions::default()).await?;
//! handle.graceful_shutdown(None).await?;
//! join.await??;
//! ```

/// Environment-driven configuration for queues, the supervisor, health and
/// the store.
pub mod config;

/// Error types for store and queue operations.
pub mod error;

/// Job and supervisor lifecycle events with an in-process broadcast bus.
pub mod events;

/// Node heartbeats and cluster health aggregation.
pub mod health;

/// Job records, statuses, failures and enqueue options.
pub mod job;

/// Store key layout.
pub mod keys;

/// Leases held by workers on started jobs, and the retry policy.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus collectors, enabled with the `metrics` feature.
pub mod metrics;

/// The task queue over a [`JobStore`].
pub mod queue;

/// Task handler registration and the per-job context.
pub mod registry;

/// Supervisor, workers and their builder.
pub mod runtime;

/// Storage backends.
pub mod store;

/// Tracing spans and lifecycle recorders.
pub mod telemetry;

pub use config::*;
pub use error::*;
pub use events::*;
pub use health::*;
pub use job::*;
pub use keys::KeySpace;
pub use lease::*;
pub use queue::*;
pub use registry::*;
pub use runtime::*;
pub use store::{JobStore, MemoryStore, ScoredMember, StoreResult};
#[cfg(feature = "redis")]
pub use store::RedisStore;
