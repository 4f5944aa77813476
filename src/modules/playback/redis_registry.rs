use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::model::{Activation, DenialReason, DeviceSession};
use super::registry::{DeviceRegistry, RegistryError};
use crate::infrastructure::redis::client::RedisService;

const ACCOUNTS_KEY: &str = "devices:accounts";

// KEYS: active zset, seen hash, accounts set
// ARGV: device, now_ms, ceiling, account
// Returns {granted, active_count}
const ACTIVATE_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
  return {1, redis.call('ZCARD', KEYS[1])}
end
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[3]) then
  return {0, count}
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[4])
return {1, count + 1}
"#;

// KEYS: active zset, seen hash
// ARGV: device, now_ms
const TOUCH_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
redis.call('ZADD', KEYS[1], 'XX', ARGV[2], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
return 1
"#;

// KEYS: active zset, seen hash, accounts set
// ARGV: cutoff_ms (exclusive), account
// Removes in batches to stay under Lua's unpack limit.
const SWEEP_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
for i = 1, #expired, 500 do
  local last = math.min(i + 499, #expired)
  redis.call('ZREM', KEYS[1], unpack(expired, i, last))
  redis.call('HDEL', KEYS[2], unpack(expired, i, last))
end
if redis.call('ZCARD', KEYS[1]) == 0 then
  redis.call('DEL', KEYS[2])
  redis.call('SREM', KEYS[3], ARGV[2])
end
return #expired
"#;

/// Device registry in Redis. Active devices of an account live in a sorted
/// set scored by last access, so the ceiling check is a `ZCARD` inside the
/// same script that inserts. The `seen` hash mirrors the set and loses a
/// device whenever the set does.
#[derive(Clone)]
pub struct RedisDeviceRegistry {
    redis: RedisService,
    activate: Script,
    touch: Script,
    sweep: Script,
}

impl RedisDeviceRegistry {
    pub fn new(redis: RedisService) -> Self {
        Self {
            redis,
            activate: Script::new(ACTIVATE_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
            sweep: Script::new(SWEEP_SCRIPT),
        }
    }

    fn active_key(account_id: Uuid) -> String {
        format!("devices:{}:active", account_id)
    }

    fn seen_key(account_id: Uuid) -> String {
        format!("devices:{}:seen", account_id)
    }
}

fn millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn redis_err(context: &str, e: redis::RedisError) -> RegistryError {
    RegistryError::Storage(anyhow!("{}: {}", context, e))
}

#[async_trait]
impl DeviceRegistry for RedisDeviceRegistry {
    async fn activate(
        &self,
        account_id: Uuid,
        device_id: &str,
        ceiling: u32,
        now: OffsetDateTime,
    ) -> Result<Activation, RegistryError> {
        let mut conn = self.redis.conn();
        let (granted, active): (i64, u32) = self
            .activate
            .key(Self::active_key(account_id))
            .key(Self::seen_key(account_id))
            .key(ACCOUNTS_KEY)
            .arg(device_id)
            .arg(millis(now))
            .arg(ceiling)
            .arg(account_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("Failed to activate device", e))?;

        Ok(if granted == 1 {
            Activation::granted(active)
        } else {
            Activation::denied(DenialReason::DeviceLimitExceeded, active)
        })
    }

    async fn deactivate(&self, account_id: Uuid, device_id: &str) -> Result<(), RegistryError> {
        let mut conn = self.redis.conn();
        let _: (i64, i64) = redis::pipe()
            .atomic()
            .zrem(Self::active_key(account_id), device_id)
            .hdel(Self::seen_key(account_id), device_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("Failed to deactivate device", e))?;
        Ok(())
    }

    async fn is_active(&self, account_id: Uuid, device_id: &str) -> Result<bool, RegistryError> {
        let mut conn = self.redis.conn();
        let score: Option<f64> = conn
            .zscore(Self::active_key(account_id), device_id)
            .await
            .map_err(|e| redis_err("Failed to read device session", e))?;
        Ok(score.is_some())
    }

    async fn touch(&self, account_id: Uuid, device_id: &str, now: OffsetDateTime) -> Result<bool, RegistryError> {
        let mut conn = self.redis.conn();
        let touched: i64 = self
            .touch
            .key(Self::active_key(account_id))
            .key(Self::seen_key(account_id))
            .arg(device_id)
            .arg(millis(now))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("Failed to touch device session", e))?;
        Ok(touched == 1)
    }

    async fn list(&self, account_id: Uuid) -> Result<Vec<DeviceSession>, RegistryError> {
        let mut conn = self.redis.conn();
        let (active, seen): (Vec<(String, f64)>, HashMap<String, i64>) = redis::pipe()
            .atomic()
            .zrange_withscores(Self::active_key(account_id), 0, -1)
            .hgetall(Self::seen_key(account_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("Failed to list device sessions", e))?;

        let active: HashMap<String, i64> = active.into_iter().map(|(d, s)| (d, s as i64)).collect();

        let mut sessions: Vec<DeviceSession> = seen
            .into_iter()
            .map(|(device_id, seen_ms)| {
                let active_ms = active.get(&device_id).copied();
                DeviceSession {
                    account_id,
                    is_active: active_ms.is_some(),
                    last_accessed_at: from_millis(active_ms.unwrap_or(seen_ms).max(seen_ms)),
                    device_id,
                }
            })
            .collect();

        sessions.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        Ok(sessions)
    }

    async fn sweep(&self, cutoff: OffsetDateTime) -> Result<usize, RegistryError> {
        let mut conn = self.redis.conn();
        let accounts: Vec<String> = conn
            .smembers(ACCOUNTS_KEY)
            .await
            .map_err(|e| redis_err("Failed to list accounts", e))?;

        let mut swept = 0;
        for account in accounts {
            let Ok(account_id) = account.parse::<Uuid>() else {
                debug!("Skipping malformed account id '{}' in device index", account);
                continue;
            };

            let removed: i64 = self
                .sweep
                .key(Self::active_key(account_id))
                .key(Self::seen_key(account_id))
                .key(ACCOUNTS_KEY)
                .arg(millis(cutoff))
                .arg(&account)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| redis_err("Failed to sweep device sessions", e))?;
            swept += removed as usize;
        }

        Ok(swept)
    }
}
