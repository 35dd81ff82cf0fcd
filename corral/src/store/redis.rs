use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::Script;
use async_trait::async_trait;
use tracing::debug;

use super::{JobStore, ScoredMember, StoreResult};
use crate::error::StoreError;

const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= ARGV[1] then
  return 0
end
if ARGV[3] == '0' then
  redis.call('SET', KEYS[1], ARGV[2])
else
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
end
return 1
"#;

const COMPARE_AND_SWAP_SCHEDULED: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
return 1
"#;

const POP_FIRST: &str = r#"
for _, key in ipairs(KEYS) do
  local member = redis.call('LPOP', key)
  if member then
    return {key, member}
  end
end
return false
"#;

const TAKE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #due > 0 then
  redis.call('ZREM', KEYS[1], unpack(due))
end
return due
"#;

const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #due > 0 then
  redis.call('ZREM', KEYS[1], unpack(due))
  redis.call('RPUSH', KEYS[2], unpack(due))
end
return #due
"#;

/// [`JobStore`] backed by Redis.
///
/// Compound operations run as Lua scripts so they are atomic across every
/// process sharing the server. The connection manager reconnects on its own;
/// while it cannot, calls fail with [`StoreError::Unavailable`].
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    compare_and_swap: Script,
    compare_and_swap_scheduled: Script,
    pop_first: Script,
    take_due: Script,
    promote_due: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the server at `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        debug!(redis_url, "connected to redis job store");
        Ok(Self::from_connection(redis))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
            compare_and_swap_scheduled: Script::new(COMPARE_AND_SWAP_SCHEDULED),
            pop_first: Script::new(POP_FIRST),
            take_due: Script::new(TAKE_DUE),
            promote_due: Script::new(PROMOTE_DUE),
        }
    }
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    // A zero TTL would delete the key immediately; clamp to 1ms.
    ttl.map_or(0, |ttl| (ttl.as_millis() as u64).max(1))
}

/// Escape glob metacharacters so a key prefix can be used with `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('*');
    escaped
}

#[async_trait]
impl JobStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl.is_some() {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn compare_and_swap_scheduled(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        entry: ScoredMember<'_>,
    ) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let swapped: i64 = self
            .compare_and_swap_scheduled
            .key(key)
            .key(entry.set)
            .arg(expected)
            .arg(value)
            .arg(entry.score)
            .arg(entry.member)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let pattern = escape_glob(prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn push_back(&self, list: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        ::redis::cmd("RPUSH")
            .arg(list)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_first(&self, lists: &[String]) -> StoreResult<Option<(String, String)>> {
        if lists.is_empty() {
            return Ok(None);
        }
        let mut conn = self.redis.clone();
        let mut invocation = self.pop_first.prepare_invoke();
        for list in lists {
            invocation.key(list);
        }
        let popped: Option<(String, String)> = invocation.invoke_async(&mut conn).await?;
        Ok(popped)
    }

    async fn remove_from_list(&self, list: &str, member: &str) -> StoreResult<usize> {
        let mut conn = self.redis.clone();
        let removed: i64 = ::redis::cmd("LREM")
            .arg(list)
            .arg(0)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed.max(0) as usize)
    }

    async fn list_len(&self, list: &str) -> StoreResult<usize> {
        let mut conn = self.redis.clone();
        let len: usize = ::redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn sorted_add(&self, set: &str, member: &str, score: i64) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        ::redis::cmd("ZADD")
            .arg(set)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn sorted_remove(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = ::redis::cmd("ZREM")
            .arg(set)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn sorted_len(&self, set: &str) -> StoreResult<usize> {
        let mut conn = self.redis.clone();
        let len: usize = ::redis::cmd("ZCARD").arg(set).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn sorted_range_from(&self, set: &str, min_score: i64) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(set)
            .arg(min_score)
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn sorted_remove_below(&self, set: &str, min_score: i64) -> StoreResult<usize> {
        let mut conn = self.redis.clone();
        let removed: i64 = ::redis::cmd("ZREMRANGEBYSCORE")
            .arg(set)
            .arg("-inf")
            .arg(format!("({min_score}"))
            .query_async(&mut conn)
            .await?;
        Ok(removed.max(0) as usize)
    }

    async fn sorted_take_due(
        &self,
        set: &str,
        max_score: i64,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let due: Vec<String> = self
            .take_due
            .key(set)
            .arg(max_score)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(due)
    }

    async fn sorted_promote_due(
        &self,
        set: &str,
        list: &str,
        max_score: i64,
        limit: usize,
    ) -> StoreResult<usize> {
        let mut conn = self.redis.clone();
        let moved: i64 = self
            .promote_due
            .key(set)
            .key(list)
            .arg(max_score)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("corral:node:"), "corral:node:*");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[test]
    fn ttl_is_clamped_to_a_millisecond() {
        assert_eq!(ttl_millis(None), 0);
        assert_eq!(ttl_millis(Some(Duration::ZERO)), 1);
        assert_eq!(ttl_millis(Some(Duration::from_secs(30))), 30_000);
    }
}
