use std::collections::{BTreeSet, HashMap};

use anyhow::anyhow;
use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use time::OffsetDateTime;
use uuid::Uuid;

use super::ledger::{UploadError, UploadLedger};
use super::model::{ChunkMark, SessionInit, UploadSession, UploadState};
use crate::infrastructure::redis::client::RedisService;

const CREATED_INDEX: &str = "uploads:created";

// KEYS: session hash, chunk set, created index
// ARGV: title, content_id, job_id, total, created_at, upload_id
const OPEN_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('HSET', KEYS[1],
    'title', ARGV[1], 'content_id', ARGV[2], 'job_id', ARGV[3],
    'total', ARGV[4], 'state', 'receiving', 'created_at', ARGV[5])
  redis.call('ZADD', KEYS[3], ARGV[5], ARGV[6])
end
return tonumber(redis.call('HGET', KEYS[1], 'total'))
"#;

// KEYS: session hash, chunk set
// ARGV: index, now
// Returns {received, total, state, claimed}; received = -1 when missing.
const MARK_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return {-1, 0, '', 0}
end
local total = tonumber(redis.call('HGET', KEYS[1], 'total'))
local claimed = 0
if state == 'receiving' then
  redis.call('SADD', KEYS[2], ARGV[1])
  if redis.call('SCARD', KEYS[2]) == total then
    state = 'finalizing'
    redis.call('HSET', KEYS[1], 'state', state, 'finalize_started_at', ARGV[2])
    claimed = 1
  end
end
return {redis.call('SCARD', KEYS[2]), total, state, claimed}
"#;

// KEYS: session hash, chunk set
// ARGV: now, stale_before
const CLAIM_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return -1
end
local total = tonumber(redis.call('HGET', KEYS[1], 'total'))
if redis.call('SCARD', KEYS[2]) < total then
  return 0
end
local started = tonumber(redis.call('HGET', KEYS[1], 'finalize_started_at') or '0')
if state == 'receiving' or (state == 'finalizing' and started < tonumber(ARGV[2])) then
  redis.call('HSET', KEYS[1], 'state', 'finalizing', 'finalize_started_at', ARGV[1])
  return 1
end
return 0
"#;

// KEYS: session hash
// ARGV: expected state, next state, last_error ('' clears it)
const TRANSITION_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return -1
end
if ARGV[1] ~= '*' and state ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[2])
redis.call('HDEL', KEYS[1], 'finalize_started_at')
if ARGV[3] == '' then
  redis.call('HDEL', KEYS[1], 'last_error')
else
  redis.call('HSET', KEYS[1], 'last_error', ARGV[3])
end
return 1
"#;

/// Upload ledger kept in Redis. Every check-and-act is a Lua script so it
/// runs as one atomic step on the server.
#[derive(Clone)]
pub struct RedisUploadLedger {
    redis: RedisService,
    open: Script,
    mark: Script,
    claim: Script,
    transition: Script,
}

impl RedisUploadLedger {
    pub fn new(redis: RedisService) -> Self {
        Self {
            redis,
            open: Script::new(OPEN_SCRIPT),
            mark: Script::new(MARK_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            transition: Script::new(TRANSITION_SCRIPT),
        }
    }

    fn session_key(upload_id: &str) -> String {
        format!("upload:{}", upload_id)
    }

    fn chunks_key(upload_id: &str) -> String {
        format!("upload:{}:chunks", upload_id)
    }

    async fn transition(
        &self,
        upload_id: &str,
        expected: Option<UploadState>,
        next: UploadState,
        error: &str,
    ) -> Result<i64, UploadError> {
        let mut conn = self.redis.conn();
        let result: i64 = self
            .transition
            .key(Self::session_key(upload_id))
            .arg(expected.map(|s| s.as_str()).unwrap_or("*"))
            .arg(next.as_str())
            .arg(error)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("Failed to update upload state", e))?;
        Ok(result)
    }
}

fn redis_err(context: &str, e: redis::RedisError) -> UploadError {
    UploadError::Storage(anyhow!("{}: {}", context, e))
}

fn corrupt(upload_id: &str, field: &str) -> UploadError {
    UploadError::Storage(anyhow!("upload {} has a corrupt '{}' field", upload_id, field))
}

fn decode(
    upload_id: &str,
    fields: &HashMap<String, String>,
    received: Vec<u32>,
) -> Result<UploadSession, UploadError> {
    let field = |name: &str| fields.get(name).ok_or_else(|| corrupt(upload_id, name));
    let uuid = |name: &str| -> Result<Uuid, UploadError> {
        field(name)?.parse().map_err(|_| corrupt(upload_id, name))
    };
    let timestamp = |raw: &str, name: &str| -> Result<OffsetDateTime, UploadError> {
        raw.parse::<i64>()
            .ok()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            .ok_or_else(|| corrupt(upload_id, name))
    };

    Ok(UploadSession {
        upload_id: upload_id.to_string(),
        title: field("title")?.clone(),
        content_id: uuid("content_id")?,
        job_id: uuid("job_id")?,
        total_chunks: field("total")?.parse().map_err(|_| corrupt(upload_id, "total"))?,
        received: received.into_iter().collect::<BTreeSet<_>>(),
        state: field("state")?.parse().map_err(|_| corrupt(upload_id, "state"))?,
        last_error: fields.get("last_error").cloned(),
        created_at: timestamp(field("created_at")?, "created_at")?,
        finalize_started_at: fields
            .get("finalize_started_at")
            .map(|raw| timestamp(raw, "finalize_started_at"))
            .transpose()?,
    })
}

#[async_trait]
impl UploadLedger for RedisUploadLedger {
    async fn open(&self, init: &SessionInit, now: OffsetDateTime) -> Result<UploadSession, UploadError> {
        let mut conn = self.redis.conn();
        let total: u32 = self
            .open
            .key(Self::session_key(&init.upload_id))
            .key(Self::chunks_key(&init.upload_id))
            .key(CREATED_INDEX)
            .arg(&init.title)
            .arg(init.content_id.to_string())
            .arg(init.job_id.to_string())
            .arg(init.total_chunks)
            .arg(now.unix_timestamp())
            .arg(&init.upload_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("Failed to open upload session", e))?;

        if total != init.total_chunks {
            return Err(UploadError::TotalMismatch {
                upload_id: init.upload_id.clone(),
                expected: total,
                got: init.total_chunks,
            });
        }

        self.get(&init.upload_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(init.upload_id.clone()))
    }

    async fn get(&self, upload_id: &str) -> Result<Option<UploadSession>, UploadError> {
        let mut conn = self.redis.conn();
        let (fields, received): (HashMap<String, String>, Vec<u32>) = redis::pipe()
            .atomic()
            .hgetall(Self::session_key(upload_id))
            .smembers(Self::chunks_key(upload_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("Failed to read upload session", e))?;

        if fields.is_empty() {
            return Ok(None);
        }

        decode(upload_id, &fields, received).map(Some)
    }

    async fn mark_received(
        &self,
        upload_id: &str,
        index: u32,
        now: OffsetDateTime,
    ) -> Result<ChunkMark, UploadError> {
        let mut conn = self.redis.conn();
        let (received, total, state, claimed): (i64, u32, String, i64) = self
            .mark
            .key(Self::session_key(upload_id))
            .key(Self::chunks_key(upload_id))
            .arg(index)
            .arg(now.unix_timestamp())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("Failed to record chunk", e))?;

        if received < 0 {
            return Err(UploadError::NotFound(upload_id.to_string()));
        }

        Ok(ChunkMark {
            received: received as u32,
            total,
            state: state.parse().map_err(|_| corrupt(upload_id, "state"))?,
            claimed_finalize: claimed == 1,
        })
    }

    async fn claim_finalize(
        &self,
        upload_id: &str,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> Result<bool, UploadError> {
        let mut conn = self.redis.conn();
        let result: i64 = self
            .claim
            .key(Self::session_key(upload_id))
            .key(Self::chunks_key(upload_id))
            .arg(now.unix_timestamp())
            .arg(stale_before.unix_timestamp())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("Failed to claim finalize", e))?;

        match result {
            -1 => Err(UploadError::NotFound(upload_id.to_string())),
            claimed => Ok(claimed == 1),
        }
    }

    async fn release_finalize(&self, upload_id: &str, error: &str) -> Result<(), UploadError> {
        self.transition(upload_id, Some(UploadState::Finalizing), UploadState::Receiving, error)
            .await?;
        Ok(())
    }

    async fn mark_finalized(&self, upload_id: &str) -> Result<(), UploadError> {
        match self.transition(upload_id, None, UploadState::Finalized, "").await? {
            -1 => Err(UploadError::NotFound(upload_id.to_string())),
            _ => Ok(()),
        }
    }

    async fn remove(&self, upload_id: &str) -> Result<(), UploadError> {
        let mut conn = self.redis.conn();
        let _: () = redis::pipe()
            .atomic()
            .del(Self::session_key(upload_id))
            .del(Self::chunks_key(upload_id))
            .zrem(CREATED_INDEX, upload_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("Failed to remove upload session", e))?;
        Ok(())
    }

    async fn expired(&self, before: OffsetDateTime) -> Result<Vec<String>, UploadError> {
        let mut conn = self.redis.conn();
        let ids: Vec<String> = conn
            .zrangebyscore(CREATED_INDEX, "-inf", format!("({}", before.unix_timestamp()))
            .await
            .map_err(|e| redis_err("Failed to scan expired uploads", e))?;
        Ok(ids)
    }
}
