//! Redis-backed broker.
//!
//! Key layout under the configured namespace `ns`:
//!
//! - `{ns}:jobs` hash of job id -> envelope JSON (waiting and claimed)
//! - `{ns}:queue:<name>` list of ready job ids (LPUSH in, RPOP out)
//! - `{ns}:scheduled:<name>` sorted set of delayed job ids by available-at ms
//! - `{ns}:inflight` sorted set of claimed job ids by visible-until ms
//! - `{ns}:claims` hash of job id -> claim nonce
//! - `{ns}:dead` list of dead envelope JSON, most recent first
//!
//! Every state transition runs as a single Lua script so claims, settles
//! and reclaims are atomic with respect to each other. The braces are a
//! Redis Cluster hash tag: all keys of one namespace live in the same slot,
//! which lets the claim script requeue lapsed claims onto queues it derives
//! from the envelope.

pub mod pool;

use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::{debug, error, warn};

use crate::{
    QueueResult, QueueError, JobId, Envelope, ClaimedJob, ClaimToken,
    broker::Broker,
    types::envelope::after,
};

pub use pool::{PooledConnection, RedisPool};

const ENQUEUE: &str = r#"
-- KEYS: jobs, queue, scheduled
-- ARGV: id, json, available_ms, now_ms
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  return 2
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
if tonumber(ARGV[3]) <= tonumber(ARGV[4]) then
  redis.call('LPUSH', KEYS[2], ARGV[1])
else
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
end
return 1
"#;

const CLAIM: &str = r#"
-- KEYS: jobs, inflight, claims, then (queue, scheduled) pairs in priority order
-- ARGV: now_ms, visible_until_ms, nonce, key prefix
local now = tonumber(ARGV[1])

local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  local json = redis.call('HGET', KEYS[1], id)
  if json then
    local queue = cjson.decode(json)['queue']
    redis.call('RPUSH', ARGV[4] .. ':queue:' .. queue, id)
  end
end

for i = 4, #KEYS, 2 do
  local due = redis.call('ZRANGEBYSCORE', KEYS[i + 1], '-inf', now)
  for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[i + 1], id)
    redis.call('LPUSH', KEYS[i], id)
  end
end

for i = 4, #KEYS, 2 do
  while true do
    local id = redis.call('RPOP', KEYS[i])
    if not id then
      break
    end
    local json = redis.call('HGET', KEYS[1], id)
    if json then
      redis.call('ZADD', KEYS[2], ARGV[2], id)
      redis.call('HSET', KEYS[3], id, ARGV[3])
      return {id, json}
    end
  end
end
return false
"#;

const ACK: &str = r#"
-- KEYS: jobs, inflight, claims
-- ARGV: id, nonce
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[1], ARGV[1])
return 1
"#;

const RETRY: &str = r#"
-- KEYS: jobs, inflight, claims, scheduled
-- ARGV: id, nonce, json, available_ms
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
return 1
"#;

const DEAD_LETTER: &str = r#"
-- KEYS: jobs, inflight, claims, dead
-- ARGV: id, nonce, json
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('LPUSH', KEYS[4], ARGV[3])
return 1
"#;

const REQUEUE: &str = r#"
-- KEYS: dead, jobs, queue
-- ARGV: dead_json, id, json
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
redis.call('LPUSH', KEYS[3], ARGV[2])
return 1
"#;

struct Scripts {
    enqueue: Script,
    claim: Script,
    ack: Script,
    retry: Script,
    dead_letter: Script,
    requeue: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            claim: Script::new(CLAIM),
            ack: Script::new(ACK),
            retry: Script::new(RETRY),
            dead_letter: Script::new(DEAD_LETTER),
            requeue: Script::new(REQUEUE),
        }
    }
}

/// Broker persisting envelopes in Redis
pub struct RedisBroker {
    pool: RedisPool,
    namespace: String,
    scripts: Scripts,
}

impl RedisBroker {
    pub fn new(pool: RedisPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            scripts: Scripts::load(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    /// Round-trip a PING
    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let result: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut *conn).await;
        conn.settle(result).map(|_| ())
    }

    /// Hash-tagged namespace shared by every key
    fn prefix(&self) -> String {
        format!("{{{}}}", self.namespace)
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.prefix())
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix(), queue)
    }

    fn scheduled_key(&self, queue: &str) -> String {
        format!("{}:scheduled:{}", self.prefix(), queue)
    }

    fn inflight_key(&self) -> String {
        format!("{}:inflight", self.prefix())
    }

    fn claims_key(&self) -> String {
        format!("{}:claims", self.prefix())
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix())
    }

    /// Dead-letter a claimed entry whose stored JSON no longer decodes,
    /// keeping the raw record with the decode error attached
    async fn bury(&self, job_id: &JobId, nonce: &str, json: &str, error: &str) -> QueueResult<()> {
        let raw = match serde_json::from_str::<serde_json::Value>(json) {
            Ok(serde_json::Value::Object(mut fields)) => {
                fields.insert("last_error".to_string(), serde_json::Value::from(error));
                serde_json::Value::Object(fields).to_string()
            }
            _ => json.to_string(),
        };

        let mut conn = self.pool.get().await?;
        let result: redis::RedisResult<i32> = self
            .scripts
            .dead_letter
            .key(self.jobs_key())
            .key(self.inflight_key())
            .key(self.claims_key())
            .key(self.dead_key())
            .arg(job_id.as_str())
            .arg(nonce)
            .arg(raw)
            .invoke_async(&mut *conn)
            .await;
        conn.settle(result)?;

        error!(job_id = %job_id, error, "Undecodable envelope dead-lettered");
        Ok(())
    }

    async fn load_envelope(&self, job_id: &JobId) -> QueueResult<Envelope> {
        let mut conn = self.pool.get().await?;
        let result: redis::RedisResult<Option<String>> = redis::cmd("HGET")
            .arg(self.jobs_key())
            .arg(job_id.as_str())
            .query_async(&mut *conn)
            .await;

        match conn.settle(result)? {
            Some(json) => Ok(Envelope::from_json(&json)?),
            None => Err(QueueError::StaleClaim(job_id.clone())),
        }
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, envelope: Envelope) -> QueueResult<JobId> {
        envelope.arguments.validate()?;
        let json = envelope.to_json()?;
        let mut conn = self.pool.get().await?;

        let result: redis::RedisResult<i32> = self
            .scripts
            .enqueue
            .key(self.jobs_key())
            .key(self.queue_key(&envelope.queue))
            .key(self.scheduled_key(&envelope.queue))
            .arg(envelope.job_id.as_str())
            .arg(json)
            .arg(millis(envelope.available_at))
            .arg(millis(Utc::now()))
            .invoke_async(&mut *conn)
            .await;

        match conn.settle(result)? {
            1 => debug!(job_id = %envelope.job_id, queue = %envelope.queue, "Enqueued"),
            _ => debug!(job_id = %envelope.job_id, "Envelope already stored"),
        }
        Ok(envelope.job_id)
    }

    async fn claim(&self, queues: &[String], visibility: Duration) -> QueueResult<Option<ClaimedJob>> {
        loop {
            let now = Utc::now();
            let visible_until = after(now, visibility);
            let nonce = uuid::Uuid::new_v4().to_string();

            let mut invocation = self.scripts.claim.prepare_invoke();
            invocation
                .key(self.jobs_key())
                .key(self.inflight_key())
                .key(self.claims_key());
            for queue in queues {
                invocation.key(self.queue_key(queue)).key(self.scheduled_key(queue));
            }
            invocation
                .arg(millis(now))
                .arg(millis(visible_until))
                .arg(&nonce)
                .arg(self.prefix());

            let claimed = {
                let mut conn = self.pool.get().await?;
                let result: redis::RedisResult<Option<(String, String)>> =
                    invocation.invoke_async(&mut *conn).await;
                conn.settle(result)?
            };

            let Some((id, json)) = claimed else {
                return Ok(None);
            };

            let job_id = JobId::from(id);
            match Envelope::from_json(&json) {
                Ok(envelope) => {
                    let token = ClaimToken::from_parts(job_id, nonce);
                    return Ok(Some(ClaimedJob::new(envelope, token, visible_until)));
                }
                Err(e) => self.bury(&job_id, &nonce, &json, &e.to_string()).await?,
            }
        }
    }

    async fn ack(&self, token: &ClaimToken) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let result: redis::RedisResult<i32> = self
            .scripts
            .ack
            .key(self.jobs_key())
            .key(self.inflight_key())
            .key(self.claims_key())
            .arg(token.job_id().as_str())
            .arg(token.nonce())
            .invoke_async(&mut *conn)
            .await;

        match conn.settle(result)? {
            1 => Ok(()),
            _ => Err(QueueError::StaleClaim(token.job_id().clone())),
        }
    }

    async fn retry(&self, token: &ClaimToken, delay: Duration, error: &str) -> QueueResult<()> {
        let next = self.load_envelope(token.job_id()).await?.next_attempt(delay, error);
        let json = next.to_json()?;

        let mut conn = self.pool.get().await?;
        let result: redis::RedisResult<i32> = self
            .scripts
            .retry
            .key(self.jobs_key())
            .key(self.inflight_key())
            .key(self.claims_key())
            .key(self.scheduled_key(&next.queue))
            .arg(token.job_id().as_str())
            .arg(token.nonce())
            .arg(json)
            .arg(millis(next.available_at))
            .invoke_async(&mut *conn)
            .await;

        match conn.settle(result)? {
            1 => Ok(()),
            _ => Err(QueueError::StaleClaim(token.job_id().clone())),
        }
    }

    async fn dead_letter(&self, token: &ClaimToken, error: &str) -> QueueResult<()> {
        let mut dead = self.load_envelope(token.job_id()).await?;
        dead.last_error = Some(error.to_string());
        let json = dead.to_json()?;

        let mut conn = self.pool.get().await?;
        let result: redis::RedisResult<i32> = self
            .scripts
            .dead_letter
            .key(self.jobs_key())
            .key(self.inflight_key())
            .key(self.claims_key())
            .key(self.dead_key())
            .arg(token.job_id().as_str())
            .arg(token.nonce())
            .arg(json)
            .invoke_async(&mut *conn)
            .await;

        match conn.settle(result)? {
            1 => {
                warn!(job_id = %token.job_id(), error, "Dead-lettered");
                Ok(())
            }
            _ => Err(QueueError::StaleClaim(token.job_id().clone())),
        }
    }

    async fn queue_depth(&self, queue: &str) -> QueueResult<usize> {
        let mut conn = self.pool.get().await?;
        let result: redis::RedisResult<(usize, usize)> = redis::pipe()
            .cmd("LLEN")
            .arg(self.queue_key(queue))
            .cmd("ZCARD")
            .arg(self.scheduled_key(queue))
            .query_async(&mut *conn)
            .await;

        let (ready, scheduled) = conn.settle(result)?;
        Ok(ready + scheduled)
    }

    async fn dead_letters(&self) -> QueueResult<Vec<Envelope>> {
        let mut conn = self.pool.get().await?;
        let result: redis::RedisResult<Vec<String>> = redis::cmd("LRANGE")
            .arg(self.dead_key())
            .arg(0)
            .arg(-1)
            .query_async(&mut *conn)
            .await;

        let entries = conn.settle(result)?;
        Ok(entries
            .iter()
            .filter_map(|json| match Envelope::from_json(json) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable dead letter");
                    None
                }
            })
            .collect())
    }

    async fn requeue_dead_letter(&self, job_id: &JobId) -> QueueResult<bool> {
        let mut conn = self.pool.get().await?;
        let result: redis::RedisResult<Vec<String>> = redis::cmd("LRANGE")
            .arg(self.dead_key())
            .arg(0)
            .arg(-1)
            .query_async(&mut *conn)
            .await;
        let entries = conn.settle(result)?;

        let mut found = None;
        for json in entries {
            let Ok(envelope) = Envelope::from_json(&json) else { continue };
            if &envelope.job_id == job_id {
                found = Some((json, envelope));
                break;
            }
        }
        let Some((dead_json, mut envelope)) = found else {
            return Ok(false);
        };

        envelope.attempt = 0;
        envelope.available_at = Utc::now();
        let json = envelope.to_json()?;

        let result: redis::RedisResult<i32> = self
            .scripts
            .requeue
            .key(self.dead_key())
            .key(self.jobs_key())
            .key(self.queue_key(&envelope.queue))
            .arg(dead_json)
            .arg(job_id.as_str())
            .arg(json)
            .invoke_async(&mut *conn)
            .await;

        Ok(conn.settle(result)? == 1)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
