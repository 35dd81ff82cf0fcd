use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{JobStore, ScoredMember, StoreResult};

/// [`JobStore`] held entirely in process memory.
///
/// Every operation runs under one mutex, so compound operations are atomic
/// with respect to each other exactly like the Lua scripts of the Redis
/// backend. Expiry is lazy and measured on the tokio clock, which lets tests
/// drive TTLs with `tokio::time::pause`/`advance`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    sorted: HashMap<String, SortedSet>,
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn remove_below(&mut self, min_score: i64) -> usize {
        let stale: Vec<(i64, String)> = self
            .ordered
            .iter()
            .take_while(|(score, _)| *score < min_score)
            .cloned()
            .collect();
        for (score, member) in &stale {
            self.ordered.remove(&(*score, member.clone()));
            self.scores.remove(member);
        }
        stale.len()
    }

    fn take_due(&mut self, max_score: i64, limit: usize) -> Vec<String> {
        let due: Vec<(i64, String)> = self
            .ordered
            .iter()
            .take_while(|(score, _)| *score <= max_score)
            .take(limit)
            .cloned()
            .collect();
        for (score, member) in &due {
            self.ordered.remove(&(*score, member.clone()));
            self.scores.remove(member);
        }
        due.into_iter().map(|(_, member)| member).collect()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    /// Drop `key` if it has expired, then return the live entry.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.inner.lock();
        Ok(inner.live(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.values.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        match inner.live(key) {
            Some(entry) if entry.value == expected => {
                *entry = Entry::new(value, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_swap_scheduled(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        entry: ScoredMember<'_>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        match inner.live(key) {
            Some(current) if current.value == expected => *current = Entry::new(value, None),
            _ => return Ok(false),
        }
        inner
            .sorted
            .entry(entry.set.to_string())
            .or_default()
            .insert(entry.member, entry.score);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let existed = inner.live(key).is_some();
        inner.values.remove(key);
        Ok(existed)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.values.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = inner
            .values
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn push_back(&self, list: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner
            .lists
            .entry(list.to_string())
            .or_default()
            .push_back(member.to_string());
        Ok(())
    }

    async fn pop_first(&self, lists: &[String]) -> StoreResult<Option<(String, String)>> {
        let mut inner = self.inner.lock();
        for list in lists {
            if let Some(member) = inner.lists.get_mut(list).and_then(VecDeque::pop_front) {
                return Ok(Some((list.clone(), member)));
            }
        }
        Ok(None)
    }

    async fn remove_from_list(&self, list: &str, member: &str) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.lists.get_mut(list) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|entry| entry != member);
        Ok(before - entries.len())
    }

    async fn list_len(&self, list: &str) -> StoreResult<usize> {
        let inner = self.inner.lock();
        Ok(inner.lists.get(list).map_or(0, VecDeque::len))
    }

    async fn sorted_add(&self, set: &str, member: &str, score: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner
            .sorted
            .entry(set.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn sorted_remove(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        Ok(inner
            .sorted
            .get_mut(set)
            .is_some_and(|sorted| sorted.remove(member)))
    }

    async fn sorted_len(&self, set: &str) -> StoreResult<usize> {
        let inner = self.inner.lock();
        Ok(inner.sorted.get(set).map_or(0, |sorted| sorted.scores.len()))
    }

    async fn sorted_range_from(&self, set: &str, min_score: i64) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .sorted
            .get(set)
            .map(|sorted| {
                sorted
                    .ordered
                    .iter()
                    .filter(|(score, _)| *score >= min_score)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn sorted_remove_below(&self, set: &str, min_score: i64) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        Ok(inner
            .sorted
            .get_mut(set)
            .map_or(0, |sorted| sorted.remove_below(min_score)))
    }

    async fn sorted_take_due(
        &self,
        set: &str,
        max_score: i64,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock();
        Ok(inner
            .sorted
            .get_mut(set)
            .map(|sorted| sorted.take_due(max_score, limit))
            .unwrap_or_default())
    }

    async fn sorted_promote_due(
        &self,
        set: &str,
        list: &str,
        max_score: i64,
        limit: usize,
    ) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        let due = match inner.sorted.get_mut(set) {
            Some(sorted) => sorted.take_due(max_score, limit),
            None => return Ok(0),
        };
        let moved = due.len();
        inner.lists.entry(list.to_string()).or_default().extend(due);
        Ok(moved)
    }
}
