use async_trait::async_trait;
use corral::{JobStore, MemoryStore, ScoredMember, StoreError, StoreResult};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wraps a [`JobStore`] with injectable outages and random latency.
///
/// Each call sleeps for a uniform `[0, max_latency]` before reaching the
/// inner store, which shakes out interleavings between concurrent workers.
/// While [`set_unavailable`](Self::set_unavailable) is on, every call fails
/// with [`StoreError::Unavailable`] without touching the inner store.
/// [`fail_nth`](Self::fail_nth) injects a single failure instead.
pub struct FaultyStore<S = MemoryStore> {
    inner: Arc<S>,
    unavailable: Arc<AtomicBool>,
    max_latency_us: Arc<AtomicU64>,
    calls: Arc<Mutex<HashMap<&'static str, u64>>>,
    // Call numbers, per operation, that fail once.
    doomed: Arc<Mutex<HashMap<&'static str, Vec<u64>>>>,
}

impl<S> Clone for FaultyStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            unavailable: Arc::clone(&self.unavailable),
            max_latency_us: Arc::clone(&self.max_latency_us),
            calls: Arc::clone(&self.calls),
            doomed: Arc::clone(&self.doomed),
        }
    }
}

impl FaultyStore<MemoryStore> {
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }
}

impl<S: JobStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Arc::new(inner),
            unavailable: Arc::new(AtomicBool::new(false)),
            max_latency_us: Arc::new(AtomicU64::new(0)),
            calls: Arc::new(Mutex::new(HashMap::new())),
            doomed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_latency(self, max_latency: Duration) -> Self {
        self.max_latency_us
            .store(max_latency.as_micros() as u64, Ordering::SeqCst);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the `n`th call to `op` from now on (1 = the next one) fail with
    /// [`StoreError::Unavailable`].
    pub fn fail_nth(&self, op: &'static str, n: u64) {
        let target = self.calls(op) + n.max(1);
        self.doomed.lock().entry(op).or_default().push(target);
    }

    /// How many times `op` was called, including calls that failed.
    pub fn calls(&self, op: &str) -> u64 {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    pub fn assert_called(&self, op: &str) {
        assert!(self.calls(op) > 0, "expected at least one {op} call");
    }

    async fn enter(&self, op: &'static str) -> StoreResult<()> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(op).or_insert(0);
            *count += 1;
            *count
        };
        let doomed = {
            let mut doomed = self.doomed.lock();
            let targets = doomed.entry(op).or_default();
            let before = targets.len();
            targets.retain(|target| *target != call);
            targets.len() != before
        };

        let max = self.max_latency_us.load(Ordering::SeqCst);
        if max > 0 {
            let micros = rand::rng().random_range(0..=max);
            tokio::time::sleep(Duration::from_micros(micros)).await;
        }

        if doomed || self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{op}: injected outage")));
        }
        Ok(())
    }
}

impl Default for FaultyStore<MemoryStore> {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[async_trait]
impl<S: JobStore> JobStore for FaultyStore<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.enter("get").await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.enter("set").await?;
        self.inner.set(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.enter("compare_and_swap").await?;
        self.inner.compare_and_swap(key, expected, value, ttl).await
    }

    async fn compare_and_swap_scheduled(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        entry: ScoredMember<'_>,
    ) -> StoreResult<bool> {
        self.enter("compare_and_swap_scheduled").await?;
        self.inner
            .compare_and_swap_scheduled(key, expected, value, entry)
            .await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.enter("delete").await?;
        self.inner.delete(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.enter("scan_prefix").await?;
        self.inner.scan_prefix(prefix).await
    }

    async fn push_back(&self, list: &str, member: &str) -> StoreResult<()> {
        self.enter("push_back").await?;
        self.inner.push_back(list, member).await
    }

    async fn pop_first(&self, lists: &[String]) -> StoreResult<Option<(String, String)>> {
        self.enter("pop_first").await?;
        self.inner.pop_first(lists).await
    }

    async fn remove_from_list(&self, list: &str, member: &str) -> StoreResult<usize> {
        self.enter("remove_from_list").await?;
        self.inner.remove_from_list(list, member).await
    }

    async fn list_len(&self, list: &str) -> StoreResult<usize> {
        self.enter("list_len").await?;
        self.inner.list_len(list).await
    }

    async fn sorted_add(&self, set: &str, member: &str, score: i64) -> StoreResult<()> {
        self.enter("sorted_add").await?;
        self.inner.sorted_add(set, member, score).await
    }

    async fn sorted_remove(&self, set: &str, member: &str) -> StoreResult<bool> {
        self.enter("sorted_remove").await?;
        self.inner.sorted_remove(set, member).await
    }

    async fn sorted_len(&self, set: &str) -> StoreResult<usize> {
        self.enter("sorted_len").await?;
        self.inner.sorted_len(set).await
    }

    async fn sorted_range_from(&self, set: &str, min_score: i64) -> StoreResult<Vec<String>> {
        self.enter("sorted_range_from").await?;
        self.inner.sorted_range_from(set, min_score).await
    }

    async fn sorted_remove_below(&self, set: &str, min_score: i64) -> StoreResult<usize> {
        self.enter("sorted_remove_below").await?;
        self.inner.sorted_remove_below(set, min_score).await
    }

    async fn sorted_take_due(
        &self,
        set: &str,
        max_score: i64,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        self.enter("sorted_take_due").await?;
        self.inner.sorted_take_due(set, max_score, limit).await
    }

    async fn sorted_promote_due(
        &self,
        set: &str,
        list: &str,
        max_score: i64,
        limit: usize,
    ) -> StoreResult<usize> {
        self.enter("sorted_promote_due").await?;
        self.inner.sorted_promote_due(set, list, max_score, limit).await
    }
}
