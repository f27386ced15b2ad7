//! Redis-backed counter storage shared by every instance of the service.
//!
//! Each counter is a hash at `<prefix><client>:<rule>` holding `count`,
//! `window_start` and `last_request_at` (unix milliseconds). Admission runs
//! as a Lua script so the read, the decision and the write cannot interleave
//! with another instance. Other writes are MULTI/EXEC pipelines. Every write
//! refreshes a per-key TTL equal to the retention horizon, so idle counters
//! expire on their own.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::RateLimitStorage;
use crate::error::{RateLimitError, Result};
use crate::ratelimit::counter::{Admission, ClientRateLimitState};

const FIELD_COUNT: &str = "count";
const FIELD_WINDOW_START: &str = "window_start";
const FIELD_LAST_REQUEST: &str = "last_request_at";

/// Keys fetched per SCAN round during a sweep.
const SCAN_BATCH: usize = 200;

/// KEYS[1] counter; ARGV now_ms, period_ms, limit, ttl_ms.
/// Returns {admitted, count, window_start, last_request_at}.
const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local period = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local count = tonumber(redis.call('HGET', key, 'count'))
local start = tonumber(redis.call('HGET', key, 'window_start'))

if count == nil or start == nil or now - start >= period then
  redis.call('DEL', key)
  redis.call('HSET', key, 'count', 1, 'window_start', now, 'last_request_at', now)
  redis.call('PEXPIRE', key, ttl)
  return {1, 1, now, now}
end

if count < limit then
  count = redis.call('HINCRBY', key, 'count', 1)
  redis.call('HSET', key, 'last_request_at', now)
  redis.call('PEXPIRE', key, ttl)
  return {1, count, start, now}
end

local last = tonumber(redis.call('HGET', key, 'last_request_at')) or start
return {0, count, start, last}
"#;

/// KEYS counters from one SCAN round; ARGV[1] cutoff_ms.
/// Deletes counters idle since before the cutoff and returns how many.
/// Keys that are not counter hashes are left alone.
const SWEEP_SCRIPT: &str = r#"
local cutoff = tonumber(ARGV[1])
local removed = 0

for _, key in ipairs(KEYS) do
  if redis.call('TYPE', key).ok == 'hash' then
    local last = tonumber(redis.call('HGET', key, 'last_request_at'))
      or tonumber(redis.call('HGET', key, 'window_start'))
    if last == nil or last < cutoff then
      redis.call('DEL', key)
      removed = removed + 1
    end
  end
end

return removed
"#;

/// Counter storage on a shared Redis instance.
#[derive(Clone)]
pub struct RedisStorage {
    conn: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
    acquire_script: Script,
    sweep_script: Script,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("key_prefix", &self.key_prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect to Redis. Counters expire `ttl` after their last write.
    pub async fn connect(url: &str, key_prefix: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(prefix = %key_prefix, ttl = ?ttl, "Connected to Redis counter storage");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            ttl,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            sweep_script: Script::new(SWEEP_SCRIPT),
        })
    }

    fn key(&self, client_id: &str, rule: &str) -> String {
        counter_key(&self.key_prefix, client_id, rule)
    }

    fn ttl_millis(&self) -> u64 {
        duration_millis(self.ttl).max(1)
    }
}

fn counter_key(prefix: &str, client_id: &str, rule: &str) -> String {
    format!("{}{}:{}", prefix, client_id, rule)
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Rebuild a counter from its hash fields. An empty hash means no counter.
fn decode_state(key: &str, fields: &HashMap<String, String>) -> Result<Option<ClientRateLimitState>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let corrupt = || RateLimitError::Storage(format!("corrupt counter entry at '{}'", key));

    let count = fields
        .get(FIELD_COUNT)
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(corrupt)?;
    let window_start = fields
        .get(FIELD_WINDOW_START)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(from_millis)
        .ok_or_else(corrupt)?;
    let last_request_at = fields
        .get(FIELD_LAST_REQUEST)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(from_millis)
        .unwrap_or(window_start);

    Ok(Some(ClientRateLimitState {
        request_count: count,
        window_start,
        last_request_at,
    }))
}

#[async_trait]
impl RateLimitStorage for RedisStorage {
    async fn get(&self, client_id: &str, rule: &str) -> Result<Option<ClientRateLimitState>> {
        let key = self.key(client_id, rule);
        let mut conn = self.conn.clone();

        let fields: HashMap<String, String> =
            redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await?;
        decode_state(&key, &fields)
    }

    async fn set(&self, client_id: &str, rule: &str, state: ClientRateLimitState) -> Result<()> {
        let key = self.key(client_id, rule);
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .cmd("HSET")
            .arg(&key)
            .arg(FIELD_COUNT)
            .arg(state.request_count)
            .arg(FIELD_WINDOW_START)
            .arg(to_millis(state.window_start))
            .arg(FIELD_LAST_REQUEST)
            .arg(to_millis(state.last_request_at))
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(self.ttl_millis())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment(
        &self,
        client_id: &str,
        rule: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientRateLimitState> {
        let key = self.key(client_id, rule);
        let mut conn = self.conn.clone();
        let now_millis = to_millis(now);

        let (fields,): (HashMap<String, String>,) = redis::pipe()
            .atomic()
            .cmd("HINCRBY")
            .arg(&key)
            .arg(FIELD_COUNT)
            .arg(1)
            .ignore()
            .cmd("HSETNX")
            .arg(&key)
            .arg(FIELD_WINDOW_START)
            .arg(now_millis)
            .ignore()
            .cmd("HSET")
            .arg(&key)
            .arg(FIELD_LAST_REQUEST)
            .arg(now_millis)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(self.ttl_millis())
            .ignore()
            .cmd("HGETALL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        decode_state(&key, &fields)?.ok_or_else(|| {
            RateLimitError::Storage(format!("counter '{}' vanished during increment", key))
        })
    }

    async fn acquire(
        &self,
        client_id: &str,
        rule: &str,
        now: DateTime<Utc>,
        period: Duration,
        limit: u64,
    ) -> Result<Admission> {
        let key = self.key(client_id, rule);
        let mut conn = self.conn.clone();

        let (admitted, count, window_start, last_request_at): (i64, u64, i64, i64) = self
            .acquire_script
            .key(&key)
            .arg(to_millis(now))
            .arg(duration_millis(period))
            .arg(limit)
            .arg(self.ttl_millis())
            .invoke_async(&mut conn)
            .await?;

        let corrupt = || RateLimitError::Storage(format!("corrupt counter entry at '{}'", key));
        Ok(Admission {
            admitted: admitted == 1,
            state: ClientRateLimitState {
                request_count: count,
                window_start: from_millis(window_start).ok_or_else(corrupt)?,
                last_request_at: from_millis(last_request_at).ok_or_else(corrupt)?,
            },
        })
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.key_prefix);
        let cutoff_millis = to_millis(cutoff);

        let mut removed = 0usize;
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                // Compare and delete server-side so a counter written after
                // the SCAN is judged on its new timestamp.
                let mut invocation = self.sweep_script.prepare_invoke();
                for key in &keys {
                    invocation.key(key);
                }
                invocation.arg(cutoff_millis);
                let swept: usize = invocation.invoke_async(&mut conn).await?;
                removed += swept;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        if removed > 0 {
            debug!(removed, "Removed expired counters from Redis");
        }
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
