//! Key scheme for everything corral persists in the job store.
//!
//! ```text
//! {ns}:job:{job_id}                 job record (JSON), TTL once terminal
//! {ns}:queue:{name}:pending         FIFO list of job ids
//! {ns}:queue:{name}:scheduled       sorted set, score = visible-at (ms)
//! {ns}:queue:{name}:started         sorted set, score = reap deadline (ms)
//! {ns}:node:{node_id}               heartbeat record (JSON), TTL
//! {ns}:nodes                        sorted set, score = last seen (ms)
//! ```

use crate::job::JobId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("corral")
    }
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    pub fn pending(&self, queue: &str) -> String {
        format!("{}:queue:{}:pending", self.namespace, queue)
    }

    pub fn scheduled(&self, queue: &str) -> String {
        format!("{}:queue:{}:scheduled", self.namespace, queue)
    }

    pub fn started(&self, queue: &str) -> String {
        format!("{}:queue:{}:started", self.namespace, queue)
    }

    pub fn heartbeat(&self, node_id: &str) -> String {
        format!("{}{}", self.heartbeat_prefix(), node_id)
    }

    pub fn heartbeat_prefix(&self) -> String {
        format!("{}:node:", self.namespace)
    }

    pub fn members(&self) -> String {
        format!("{}:nodes", self.namespace)
    }
}
