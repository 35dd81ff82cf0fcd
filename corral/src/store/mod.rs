use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// In-process store with the same atomicity as the networked backends.
pub mod memory;

#[cfg(feature = "redis")]
/// Redis-backed store, enabled with the `redis` feature.
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// A sorted-set insertion carried alongside another write.
#[derive(Clone, Copy, Debug)]
pub struct ScoredMember<'a> {
    pub set: &'a str,
    pub member: &'a str,
    pub score: i64,
}

/// The shared key-value/list/sorted-set substrate every process talks to.
///
/// Each method is a single atomic operation against the backend. Workers
/// never lock around calls to the store; correctness under concurrency comes
/// from `compare_and_swap`, `pop_first` and the sorted-set takes alone.
/// Blocking waits are deliberately absent: callers poll, so cancelling a
/// caller's future can never strand a popped value.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditional write. `ttl = None` makes the key persistent.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Write `value` only if the key currently holds exactly `expected`.
    /// Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Persistent `compare_and_swap` that also inserts `entry` into its
    /// sorted set when the swap happens, in the same atomic step.
    async fn compare_and_swap_scheduled(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        entry: ScoredMember<'_>,
    ) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Append to the tail of a list.
    async fn push_back(&self, list: &str, member: &str) -> StoreResult<()>;

    /// Pop the head of the first non-empty list, consulting `lists` in order.
    /// Returns the list name and the popped member.
    async fn pop_first(&self, lists: &[String]) -> StoreResult<Option<(String, String)>>;

    /// Remove every occurrence of `member`, returning how many were removed.
    async fn remove_from_list(&self, list: &str, member: &str) -> StoreResult<usize>;

    async fn list_len(&self, list: &str) -> StoreResult<usize>;

    /// Insert or re-score a sorted-set member.
    async fn sorted_add(&self, set: &str, member: &str, score: i64) -> StoreResult<()>;

    async fn sorted_remove(&self, set: &str, member: &str) -> StoreResult<bool>;

    async fn sorted_len(&self, set: &str) -> StoreResult<usize>;

    /// Members with `score >= min_score`, ascending by score.
    async fn sorted_range_from(&self, set: &str, min_score: i64) -> StoreResult<Vec<String>>;

    /// Remove every member with `score < min_score`, returning how many.
    async fn sorted_remove_below(&self, set: &str, min_score: i64) -> StoreResult<usize>;

    /// Atomically remove and return up to `limit` members with
    /// `score <= max_score`, lowest score first.
    async fn sorted_take_due(
        &self,
        set: &str,
        max_score: i64,
        limit: usize,
    ) -> StoreResult<Vec<String>>;

    /// Atomically move up to `limit` due members from `set` onto the tail of
    /// `list`, lowest score first. Returns how many moved.
    async fn sorted_promote_due(
        &self,
        set: &str,
        list: &str,
        max_score: i64,
        limit: usize,
    ) -> StoreResult<usize>;
}
