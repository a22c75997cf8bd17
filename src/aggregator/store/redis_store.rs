use super::{AppendOutcome, BufferStore, WindowLease};
use crate::bus::{ConversationKey, Fragment};
use crate::errors::{CoalesceError, CoalesceResult};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, warn};

/// Returns `{len, opened}`, or `{-len, 0}` without writing when the list is full.
const APPEND_SCRIPT: &str = r"
local len = redis.call('LLEN', KEYS[1])
if len >= tonumber(ARGV[2]) then
  return {-len, 0}
end
len = redis.call('RPUSH', KEYS[1], ARGV[1])
if redis.call('SET', KEYS[2], ARGV[3], 'NX', 'EX', ARGV[4]) then
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[5])
  return {len, 1}
end
return {len, 0}
";

const MARK_ACTIVE_SCRIPT: &str = r"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
  redis.call('ZADD', KEYS[2], ARGV[1], ARGV[3])
  return 1
end
return 0
";

/// Nil when the schedule no longer carries this deadline.
const CLAIM_DRAIN_SCRIPT: &str = r"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) ~= tonumber(ARGV[2]) then
  return false
end
local items = redis.call('LRANGE', KEYS[2], 0, -1)
redis.call('DEL', KEYS[2], KEYS[3])
redis.call('ZREM', KEYS[1], ARGV[1])
return items
";

fn decode_fragments(key: &ConversationKey, raw: Vec<String>) -> Vec<Fragment> {
    let mut fragments = Vec::with_capacity(raw.len());
    for entry in raw {
        match serde_json::from_str::<Fragment>(&entry) {
            Ok(fragment) => fragments.push(fragment),
            Err(e) => warn!("skipping undecodable buffered entry for {}: {}", key, e),
        }
    }
    debug!("drained {} fragments for {}", fragments.len(), key);
    fragments
}

/// Redis-backed buffer store shared by every gateway instance.
///
/// Layout (all keys carry the configured prefix):
/// - `chat:{channel}:{user}`: list of JSON fragments, appended with RPUSH
/// - `start:{channel}:{user}`: marker, value = deadline ms, expires after the marker TTL
/// - `windows:due`: sorted set of `{channel}:{user}` scored by deadline ms
pub struct RedisBufferStore {
    manager: ConnectionManager,
    prefix: String,
    append_script: redis::Script,
    mark_active_script: redis::Script,
    claim_drain_script: redis::Script,
}

impl RedisBufferStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> CoalesceResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            CoalesceError::Config(format!("invalid redis url: {}", e))
        })?;
        let manager = client.get_connection_manager().await.map_err(|e| {
            CoalesceError::storage(format!("failed to connect to redis: {}", e))
        })?;
        Ok(Self::with_manager(manager, prefix))
    }

    pub fn with_manager(manager: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            manager,
            prefix: prefix.into(),
            append_script: redis::Script::new(APPEND_SCRIPT),
            mark_active_script: redis::Script::new(MARK_ACTIVE_SCRIPT),
            claim_drain_script: redis::Script::new(CLAIM_DRAIN_SCRIPT),
        }
    }

    fn schedule_key(&self) -> String {
        format!("{}windows:due", self.prefix)
    }
}

#[async_trait]
impl BufferStore for RedisBufferStore {
    async fn append(
        &self,
        key: &ConversationKey,
        fragment: &Fragment,
        max: usize,
        window: WindowLease,
    ) -> CoalesceResult<AppendOutcome> {
        let payload = serde_json::to_string(fragment)
            .map_err(|e| CoalesceError::Internal(anyhow::anyhow!("encode fragment: {}", e)))?;
        let mut conn = self.manager.clone();
        let (result, opened): (i64, i64) = self
            .append_script
            .key(key.buffer_key(&self.prefix))
            .key(key.marker_key(&self.prefix))
            .key(self.schedule_key())
            .arg(payload)
            .arg(max)
            .arg(window.deadline_ms)
            .arg(window.ttl.as_secs().max(1))
            .arg(key.timer_key())
            .invoke_async(&mut conn)
            .await?;
        let len = usize::try_from(result.unsigned_abs()).unwrap_or(usize::MAX);
        if result < 0 {
            Ok(AppendOutcome::Full { len })
        } else {
            Ok(AppendOutcome::Appended {
                len,
                opened: opened == 1,
            })
        }
    }

    async fn mark_active(
        &self,
        key: &ConversationKey,
        ttl: Duration,
        deadline_ms: i64,
    ) -> CoalesceResult<bool> {
        let mut conn = self.manager.clone();
        let set: i64 = self
            .mark_active_script
            .key(key.marker_key(&self.prefix))
            .key(self.schedule_key())
            .arg(deadline_ms)
            .arg(ttl.as_secs().max(1))
            .arg(key.timer_key())
            .invoke_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn drain(&self, key: &ConversationKey) -> CoalesceResult<Vec<Fragment>> {
        let list_key = key.buffer_key(&self.prefix);
        let mut conn = self.manager.clone();
        let (raw,): (Vec<String>,) = redis::pipe()
            .atomic()
            .lrange(&list_key, 0, -1)
            .del(&list_key)
            .ignore()
            .del(key.marker_key(&self.prefix))
            .ignore()
            .zrem(self.schedule_key(), key.timer_key())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(decode_fragments(key, raw))
    }

    async fn claim_and_drain(
        &self,
        key: &ConversationKey,
        deadline_ms: i64,
    ) -> CoalesceResult<Option<Vec<Fragment>>> {
        let mut conn = self.manager.clone();
        let raw: Option<Vec<String>> = self
            .claim_drain_script
            .key(self.schedule_key())
            .key(key.buffer_key(&self.prefix))
            .key(key.marker_key(&self.prefix))
            .arg(key.timer_key())
            .arg(deadline_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(raw.map(|raw| decode_fragments(key, raw)))
    }

    async fn due_windows(
        &self,
        cutoff_ms: i64,
        limit: usize,
    ) -> CoalesceResult<Vec<(ConversationKey, i64)>> {
        let mut conn = self.manager.clone();
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let entries: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(self.schedule_key(), "-inf", cutoff_ms, 0, count)
            .await?;

        let due = entries
            .into_iter()
            .filter_map(|(member, score)| match ConversationKey::parse(&member) {
                Some(key) => Some((key, score as i64)),
                None => {
                    warn!("ignoring malformed schedule member '{}'", member);
                    None
                }
            })
            .collect();
        Ok(due)
    }

    async fn pending_len(&self, key: &ConversationKey) -> CoalesceResult<usize> {
        let mut conn = self.manager.clone();
        let len: usize = conn.llen(key.buffer_key(&self.prefix)).await?;
        Ok(len)
    }

    async fn ping(&self) -> CoalesceResult<()> {
        let mut conn = self.manager.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
