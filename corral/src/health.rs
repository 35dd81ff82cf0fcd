//! Cluster health registry.
//!
//! Each node periodically writes a heartbeat record with a TTL. A node is
//! healthy exactly while its heartbeat is unexpired; nothing deeper is
//! checked here. Nodes are also recorded in a membership set scored by their
//! last publish time, which is what `total_count` is drawn from.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

use crate::config::HealthConfig;
use crate::error::StoreError;
use crate::keys::KeySpace;
use crate::runtime::ShutdownToken;
use crate::store::JobStore;
use crate::telemetry;

const NODE_ID_MAX_LEN: usize = 64;

/// Validated identifier of a node in the cluster.
///
/// Must be 1 to 64 characters of ASCII letters, digits, `.`, `_` or `-`, so
/// it can be embedded in store keys unescaped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeIdError {
    #[error("node id must not be empty")]
    Empty,
    #[error("node id is {0} characters, at most 64 allowed")]
    TooLong(usize),
    #[error("node id contains invalid character {0:?}")]
    InvalidChar(char),
}

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(NodeIdError::Empty);
        }
        if s.len() > NODE_ID_MAX_LEN {
            return Err(NodeIdError::TooLong(s.len()));
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(NodeIdError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for NodeId {
    type Error = NodeIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a node reports about itself each beat.
#[derive(Clone, Debug, Default)]
pub struct HeartbeatInfo {
    pub worker_count: usize,
    pub uptime: Duration,
}

/// Heartbeat as stored and as returned from [`HealthRegistry::aggregate_health`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub node_id: NodeId,
    pub worker_count: usize,
    pub uptime_seconds: u64,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub version: String,
}

/// Aggregate answer for load balancers and health endpoints.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// Nodes with a live heartbeat, ordered by node id.
    pub nodes: Vec<HeartbeatRecord>,
    pub healthy_count: usize,
    /// Nodes seen within the membership window, live or not.
    pub total_count: usize,
}

impl ClusterHealth {
    pub fn is_healthy(&self) -> bool {
        self.healthy_count > 0
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "nodes": self.nodes,
            "healthy_count": self.healthy_count,
            "total_count": self.total_count,
        })
    }
}

/// Reads and writes heartbeats in a [`JobStore`].
pub struct HealthRegistry<S: JobStore> {
    store: Arc<S>,
    keys: KeySpace,
    config: HealthConfig,
    hostname: Option<String>,
}

impl<S: JobStore> fmt::Debug for HealthRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("store_type", &std::any::type_name::<S>())
            .field("namespace", &self.keys.namespace())
            .field("config", &self.config)
            .finish()
    }
}

impl<S: JobStore> HealthRegistry<S> {
    pub fn new(store: Arc<S>, config: HealthConfig) -> Self {
        Self {
            store,
            keys: KeySpace::default(),
            config,
            hostname: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
        }
    }

    pub fn with_keys(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_hostname(mut self, hostname: Option<String>) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Write this node's heartbeat with the configured TTL and refresh its
    /// membership.
    pub async fn publish_heartbeat(
        &self,
        node_id: &NodeId,
        info: HeartbeatInfo,
    ) -> Result<HeartbeatRecord, StoreError> {
        let record = HeartbeatRecord {
            node_id: node_id.clone(),
            worker_count: info.worker_count,
            uptime_seconds: info.uptime.as_secs(),
            last_seen: Utc::now(),
            hostname: self.hostname.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let encoded = serde_json::to_string(&record).map_err(|e| StoreError::Backend(e.to_string()))?;

        self.store
            .set(
                &self.keys.heartbeat(node_id.as_str()),
                &encoded,
                Some(self.config.heartbeat_ttl()),
            )
            .await?;
        self.store
            .sorted_add(
                &self.keys.members(),
                node_id.as_str(),
                record.last_seen.timestamp_millis(),
            )
            .await?;
        let pruned = self
            .store
            .sorted_remove_below(&self.keys.members(), self.membership_cutoff())
            .await?;
        if pruned > 0 {
            debug!(pruned, "dropped members silent past the membership window");
        }

        debug!(node_id = %node_id, workers = record.worker_count, "heartbeat published");
        Ok(record)
    }

    /// Scan live heartbeats.
    ///
    /// Records that fail to decode are skipped with a warning; they still
    /// count towards `total_count` through membership.
    pub async fn aggregate_health(&self) -> Result<ClusterHealth, StoreError> {
        let mut nodes = Vec::new();
        for key in self.store.scan_prefix(&self.keys.heartbeat_prefix()).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<HeartbeatRecord>(&raw) {
                Ok(record) => nodes.push(record),
                Err(err) => warn!(key, error = %err, "skipping unreadable heartbeat"),
            }
        }
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let mut members = self
            .store
            .sorted_range_from(&self.keys.members(), self.membership_cutoff())
            .await?;
        members.extend(nodes.iter().map(|n| n.node_id.to_string()));
        members.sort_unstable();
        members.dedup();

        Ok(ClusterHealth {
            healthy_count: nodes.len(),
            total_count: members.len(),
            nodes,
        })
    }

    /// Membership score below which a node no longer counts.
    fn membership_cutoff(&self) -> i64 {
        let window = chrono::TimeDelta::from_std(self.config.membership_window())
            .unwrap_or(chrono::TimeDelta::MAX);
        Utc::now()
            .checked_sub_signed(window)
            .map_or(i64::MIN, |since| since.timestamp_millis())
    }

    /// Remove a node's heartbeat and membership, for graceful shutdown.
    pub async fn deregister(&self, node_id: &NodeId) -> Result<(), StoreError> {
        self.store.delete(&self.keys.heartbeat(node_id.as_str())).await?;
        self.store
            .sorted_remove(&self.keys.members(), node_id.as_str())
            .await?;
        info!(node_id = %node_id, "node deregistered");
        Ok(())
    }
}

/// Publish heartbeats every `publish_interval` until `shutdown` fires, then
/// deregister the node.
///
/// `info` is sampled on every beat. Store failures are logged and retried on
/// the next tick; they never stop the publisher.
pub fn spawn_heartbeat_publisher<S, F>(
    registry: Arc<HealthRegistry<S>>,
    node_id: NodeId,
    info: F,
    shutdown: ShutdownToken,
) -> JoinHandle<()>
where
    S: JobStore,
    F: Fn() -> HeartbeatInfo + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(registry.config().publish_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let span = telemetry::heartbeat_span(node_id.as_str());
            match registry.publish_heartbeat(&node_id, info()).instrument(span).await {
                Ok(_) => {}
                Err(err) if err.is_unavailable() => {
                    telemetry::record_store_unavailable("publish_heartbeat", &err);
                }
                Err(err) => warn!(node_id = %node_id, error = %err, "heartbeat publish failed"),
            }
        }

        if let Err(err) = registry.deregister(&node_id).await {
            warn!(node_id = %node_id, error = %err, "could not deregister node");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry(ttl_secs: u64) -> HealthRegistry<MemoryStore> {
        HealthRegistry::new(
            Arc::new(MemoryStore::new()),
            HealthConfig {
                heartbeat_ttl_secs: ttl_secs,
                publish_interval_secs: 1,
                membership_window_secs: 3600,
            },
        )
        .with_hostname(Some("host-a".into()))
    }

    fn node(id: &str) -> NodeId {
        id.parse().unwrap()
    }

    #[test]
    fn node_ids_are_validated() {
        assert!("web-1.example_a".parse::<NodeId>().is_ok());
        assert_eq!("".parse::<NodeId>(), Err(NodeIdError::Empty));
        assert_eq!("a b".parse::<NodeId>(), Err(NodeIdError::InvalidChar(' ')));
        assert_eq!("a:b".parse::<NodeId>(), Err(NodeIdError::InvalidChar(':')));
        assert_eq!("x".repeat(65).parse::<NodeId>(), Err(NodeIdError::TooLong(65)));
        assert!(serde_json::from_str::<NodeId>("\"bad id\"").is_err());
    }

    #[tokio::test]
    async fn published_nodes_are_healthy() {
        let registry = registry(30);
        let info = HeartbeatInfo {
            worker_count: 4,
            uptime: Duration::from_secs(90),
        };
        registry.publish_heartbeat(&node("b"), info.clone()).await.unwrap();
        registry.publish_heartbeat(&node("a"), info).await.unwrap();

        let health = registry.aggregate_health().await.unwrap();
        assert_eq!(health.healthy_count, 2);
        assert_eq!(health.total_count, 2);
        assert_eq!(health.nodes[0].node_id, node("a"));
        assert_eq!(health.nodes[0].worker_count, 4);
        assert_eq!(health.nodes[0].uptime_seconds, 90);
        assert_eq!(health.nodes[0].hostname.as_deref(), Some("host-a"));

        let json = health.to_json();
        assert_eq!(json["healthy_count"], 2);
        assert_eq!(json["nodes"][1]["node_id"], "b");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_nodes_expire_but_stay_members() {
        let registry = registry(30);
        registry
            .publish_heartbeat(&node("a"), HeartbeatInfo::default())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let health = registry.aggregate_health().await.unwrap();
        assert!(health.nodes.is_empty());
        assert_eq!(health.healthy_count, 0);
        assert_eq!(health.total_count, 1);
        assert!(!health.is_healthy());
    }

    #[tokio::test]
    async fn publishing_prunes_members_outside_the_window() {
        let registry = registry(30);
        let long_ago = (Utc::now() - chrono::TimeDelta::hours(2)).timestamp_millis();
        for restarted in ["corral-101", "corral-102"] {
            registry
                .store
                .sorted_add(&registry.keys.members(), restarted, long_ago)
                .await
                .unwrap();
        }

        registry
            .publish_heartbeat(&node("corral-103"), HeartbeatInfo::default())
            .await
            .unwrap();

        assert_eq!(registry.store.sorted_len(&registry.keys.members()).await.unwrap(), 1);
        let health = registry.aggregate_health().await.unwrap();
        assert_eq!(health.total_count, 1);
        assert_eq!(health.healthy_count, 1);
    }

    #[tokio::test]
    async fn deregistered_nodes_disappear() {
        let registry = registry(30);
        let id = node("a");
        registry.publish_heartbeat(&id, HeartbeatInfo::default()).await.unwrap();
        registry.deregister(&id).await.unwrap();

        let health = registry.aggregate_health().await.unwrap();
        assert_eq!(health, ClusterHealth::default());
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_beats_until_shutdown_then_deregisters() {
        let registry = Arc::new(registry(3));
        let shutdown = ShutdownToken::new();
        let handle = spawn_heartbeat_publisher(
            Arc::clone(&registry),
            node("a"),
            || HeartbeatInfo {
                worker_count: 2,
                uptime: Duration::ZERO,
            },
            shutdown.clone(),
        );

        // Outlive several TTLs; the publisher keeps the node alive.
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(registry.aggregate_health().await.unwrap().healthy_count, 1);

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(registry.aggregate_health().await.unwrap().total_count, 0);
    }
}
