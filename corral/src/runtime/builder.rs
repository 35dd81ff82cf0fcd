use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::QueueConfig;
use crate::events::{JobEventBus, SupervisorEventBus};
use crate::keys::KeySpace;
use crate::queue::TaskQueue;
use crate::registry::TaskRegistry;
use crate::store::JobStore;

use super::supervisor::{Supervisor, SupervisorConfig};

/// Builder for a [`Supervisor`] and the [`TaskQueue`] it drives.
///
/// Either hand it a ready queue with [`with_queue`](Self::with_queue), or
/// give it a store and a registry and let it assemble one from the queue
/// configuration. Both configurations are validated in [`build`](Self::build).
///
/// # Example
///
/// ```ignore
/// use corral::*;
///
/// let supervisor = SupervisorBuilder::new(SupervisorConfig::default())
///     .with_store(Arc::new(MemoryStore::new()))
///     .with_registry(Arc::new(registry))
///     .build()?;
/// let (handle, join) = supervisor.spawn();
/// ```
pub struct SupervisorBuilder<S: JobStore> {
    config: SupervisorConfig,
    queue_config: QueueConfig,
    queue: Option<Arc<TaskQueue<S>>>,
    store: Option<Arc<S>>,
    registry: Option<Arc<TaskRegistry>>,
    keys: Option<KeySpace>,
    job_events: Option<JobEventBus>,
    events: Option<SupervisorEventBus>,
}

impl<S: JobStore> fmt::Debug for SupervisorBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SupervisorBuilder");
        debug.field("config", &self.config);
        debug.field("queue_config", &self.queue_config);
        debug.field("queue_set", &self.queue.is_some());
        debug.field("store_set", &self.store.is_some());
        debug.field("registry_set", &self.registry.is_some());
        debug.field("events_set", &self.events.is_some());

        if self.queue.is_some() || self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }

        debug.finish()
    }
}

impl<S: JobStore> SupervisorBuilder<S> {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            queue_config: QueueConfig::default(),
            queue: None,
            store: None,
            registry: None,
            keys: None,
            job_events: None,
            events: None,
        }
    }

    /// Replace the supervisor configuration.
    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an already constructed queue. Store, registry and queue
    /// configuration are then ignored.
    pub fn with_queue(mut self, queue: Arc<TaskQueue<S>>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_queue_config(mut self, queue_config: QueueConfig) -> Self {
        self.queue_config = queue_config;
        self
    }

    /// Namespace the assembled queue's keys.
    pub fn with_keys(mut self, keys: KeySpace) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_job_events(mut self, events: JobEventBus) -> Self {
        self.job_events = Some(events);
        self
    }

    pub fn with_events(mut self, events: SupervisorEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, or if no queue was
    /// given and the store or registry needed to assemble one is missing.
    pub fn build(self) -> anyhow::Result<Supervisor<S>> {
        self.config.validate()?;

        let queue = match self.queue {
            Some(queue) => queue,
            None => {
                self.queue_config.validate()?;
                let store = self
                    .store
                    .ok_or_else(|| anyhow::anyhow!("queue dependency missing: set a queue or a store"))?;
                let registry = self
                    .registry
                    .ok_or_else(|| anyhow::anyhow!("registry dependency missing"))?;

                let mut queue = TaskQueue::new(store, registry, self.queue_config);
                if let Some(keys) = self.keys {
                    queue = queue.with_keys(keys);
                }
                if let Some(events) = self.job_events {
                    queue = queue.with_events(events);
                }
                Arc::new(queue)
            }
        };

        let supervisor = Supervisor::new(self.config, queue);
        Ok(match self.events {
            Some(events) => supervisor.with_events(events),
            None => supervisor,
        })
    }
}
