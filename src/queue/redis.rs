//! Redis job storage.
//!
//! Each queue uses three keys:
//!
//! - `queues:{name}`: list of ready payloads, popped from the head
//! - `queues:{name}:delayed`: sorted set scored by the unix time a payload becomes ready
//! - `queues:{name}:reserved`: sorted set scored by the unix time a reservation expires
//!
//! Every multi-key step runs as a Lua script so a payload is never visible in
//! two places at once. Redis payloads carry their own `id` and `attempts`;
//! attempts is bumped every time the payload moves into the reserved set.

use crate::{
    QueueworkError, Result,
    job::{Job, JobId, JobState, delay_secs, unix_now},
    payload::Payload,
    queue::Queue,
};
use async_trait::async_trait;
use redis::{Script, aio::MultiplexedConnection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const SIZE_LUA: &str = include_str!("lua/size.lua");
const POP_LUA: &str = include_str!("lua/pop.lua");
const RELEASE_LUA: &str = include_str!("lua/release.lua");
const MIGRATE_EXPIRED_JOBS_LUA: &str = include_str!("lua/migrate_expired_jobs.lua");

/// Reservation window used when `retry_after` is not configured.
const DEFAULT_RESERVATION_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisOptions {
    /// Queue used when callers pass `None`
    pub queue: String,
    /// Seconds before an undeleted reservation is moved back to the ready list.
    /// Expired reservations are only recovered when this is set.
    pub retry_after: Option<u64>,
    /// Block up to this many seconds on `BLPOP` instead of polling. Zero polls.
    pub block_for: Option<u64>,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            retry_after: Some(90),
            block_for: None,
        }
    }
}

impl RedisOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_retry_after(mut self, seconds: Option<u64>) -> Self {
        self.retry_after = seconds;
        self
    }

    pub fn with_block_for(mut self, seconds: Option<u64>) -> Self {
        self.block_for = seconds;
        self
    }

    /// Seconds to block for, if any. `BLPOP` with a zero timeout never returns.
    fn blocking_window(&self) -> Option<u64> {
        self.block_for.filter(|secs| *secs > 0)
    }

    /// Score a reservation made at `now` expires at.
    fn reservation_expiry(&self, now: i64) -> i64 {
        let window = self.retry_after.unwrap_or(DEFAULT_RESERVATION_SECS);
        now.saturating_add(delay_secs(Duration::from_secs(window)))
    }
}

/// Key of the ready list for `queue`.
pub fn queue_key(queue: &str) -> String {
    format!("queues:{}", queue)
}

pub fn delayed_key(queue_key: &str) -> String {
    format!("{}:delayed", queue_key)
}

pub fn reserved_key(queue_key: &str) -> String {
    format!("{}:reserved", queue_key)
}

/// Serialize a payload in the Redis shape: a fresh 32-character id and zero attempts.
/// Encode with a fresh id and `"attempts":0` as the final key, so attempts can
/// be bumped in place without re-encoding `data`.
fn redis_payload(payload: &Payload) -> Result<String> {
    let mut payload = payload.clone();
    payload.id = Some(uuid::Uuid::new_v4().simple().to_string());
    payload.attempts = None;
    let encoded = payload.encode()?;
    let body = encoded
        .strip_suffix('}')
        .ok_or_else(|| QueueworkError::InvalidJobPayload {
            message: "Encoded payload is not a JSON object".to_string(),
        })?;
    Ok(format!(r#"{},"attempts":0}}"#, body))
}

fn payload_id(raw: &str) -> JobId {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|value| value.get("id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

/// Bump a ready payload's attempts, as the pop script does.
fn increment_attempts(raw: &str) -> Result<String> {
    if let Some(bumped) = bump_trailing_attempts(raw) {
        return Ok(bumped);
    }

    let mut value: Value = serde_json::from_str(raw)?;
    let Some(object) = value.as_object_mut() else {
        return Err(QueueworkError::InvalidJobPayload {
            message: "Redis payload is not a JSON object".to_string(),
        });
    };
    let attempts = object.get("attempts").and_then(Value::as_u64).unwrap_or(0);
    object.insert("attempts".to_string(), Value::from(attempts + 1));
    Ok(serde_json::to_string(&value)?)
}

/// Rewrite a trailing `"attempts":N}` and leave the rest of the text untouched.
fn bump_trailing_attempts(raw: &str) -> Option<String> {
    let body = raw.strip_suffix('}')?;
    let head = body.trim_end_matches(|c: char| c.is_ascii_digit());
    let attempts: u32 = body[head.len()..].parse().ok()?;
    head.ends_with(r#""attempts":"#)
        .then(|| format!("{}{}}}", head, attempts + 1))
}

#[derive(Clone)]
struct Scripts {
    size: Script,
    pop: Script,
    release: Script,
    migrate_expired_jobs: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            size: Script::new(SIZE_LUA),
            pop: Script::new(POP_LUA),
            release: Script::new(RELEASE_LUA),
            migrate_expired_jobs: Script::new(MIGRATE_EXPIRED_JOBS_LUA),
        }
    }
}

/// A [`Queue`] stored in Redis.
#[derive(Clone)]
pub struct RedisQueue {
    conn: MultiplexedConnection,
    scripts: Scripts,
    options: RedisOptions,
    connection_name: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, options: RedisOptions) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::with_connection(conn, options))
    }

    pub fn with_connection(conn: MultiplexedConnection, options: RedisOptions) -> Self {
        Self {
            conn,
            scripts: Scripts::new(),
            options,
            connection_name: "redis".to_string(),
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn options(&self) -> &RedisOptions {
        &self.options
    }

    /// The underlying connection, for callers sharing it (such as the restart signal).
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn key_for(&self, queue: Option<&str>) -> String {
        queue_key(self.queue_name(queue))
    }

    /// Move due delayed jobs, and expired reservations when `retry_after` is
    /// configured, onto the ready list.
    pub async fn migrate(&self, queue: Option<&str>) -> Result<()> {
        let key = self.key_for(queue);
        self.migrate_expired_jobs(&delayed_key(&key), &key).await?;

        if self.options.retry_after.is_some() {
            self.migrate_expired_jobs(&reserved_key(&key), &key).await?;
        }

        Ok(())
    }

    /// Move every member of the `from` set scored at or before now to the tail
    /// of the `to` list. Returns the moved payloads.
    pub async fn migrate_expired_jobs(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let moved: Vec<String> = self
            .scripts
            .migrate_expired_jobs
            .key(from)
            .key(to)
            .arg(unix_now())
            .invoke_async(&mut conn)
            .await?;

        if !moved.is_empty() {
            debug!("Migrated {} jobs from {} to {}", moved.len(), from, to);
        }
        Ok(moved)
    }

    async fn retrieve_next_job(&self, key: &str) -> Result<Option<(String, String)>> {
        match self.options.blocking_window() {
            Some(block_for) => self.blocking_pop(key, block_for).await,
            None => {
                let mut conn = self.conn.clone();
                let (job, reserved): (Option<String>, Option<String>) = self
                    .scripts
                    .pop
                    .key(key)
                    .key(reserved_key(key))
                    .arg(self.options.reservation_expiry(unix_now()))
                    .invoke_async(&mut conn)
                    .await?;

                Ok(job.zip(reserved))
            }
        }
    }

    async fn blocking_pop(&self, key: &str, block_for: u64) -> Result<Option<(String, String)>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(block_for)
            .query_async(&mut conn)
            .await?;

        let Some((_, job)) = popped else {
            return Ok(None);
        };

        let reserved = increment_attempts(&job)?;
        let _: i64 = redis::cmd("ZADD")
            .arg(reserved_key(key))
            .arg(self.options.reservation_expiry(unix_now()))
            .arg(&reserved)
            .query_async(&mut conn)
            .await?;

        Ok(Some((job, reserved)))
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn connection_name(&self) -> &str {
        &self.connection_name
    }

    fn default_queue(&self) -> &str {
        &self.options.queue
    }

    fn create_payload(&self, payload: &Payload) -> Result<String> {
        redis_payload(payload)
    }

    async fn size(&self, queue: Option<&str>) -> Result<u64> {
        let key = self.key_for(queue);
        let mut conn = self.conn.clone();
        let size: u64 = self
            .scripts
            .size
            .key(&key)
            .key(delayed_key(&key))
            .key(reserved_key(&key))
            .invoke_async(&mut conn)
            .await?;
        Ok(size)
    }

    async fn push_raw(&self, payload: String, queue: Option<&str>) -> Result<JobId> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(self.key_for(queue))
            .arg(&payload)
            .query_async(&mut conn)
            .await?;
        Ok(payload_id(&payload))
    }

    async fn later_raw(
        &self,
        delay: Duration,
        payload: String,
        queue: Option<&str>,
    ) -> Result<JobId> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(delayed_key(&self.key_for(queue)))
            .arg(unix_now().saturating_add(delay_secs(delay)))
            .arg(&payload)
            .query_async(&mut conn)
            .await?;
        Ok(payload_id(&payload))
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<Box<dyn Job>>> {
        self.migrate(queue).await?;

        let key = self.key_for(queue);
        let Some((job, reserved)) = self.retrieve_next_job(&key).await? else {
            return Ok(None);
        };

        let payload = Payload::decode(&reserved).map_err(|e| QueueworkError::InvalidJobPayload {
            message: format!("reserved payload on {}: {}", key, e),
        })?;

        Ok(Some(Box::new(RedisJob {
            queue: self.clone(),
            queue_name: self.queue_name(queue).to_string(),
            job,
            reserved,
            payload,
            state: JobState::default(),
        })))
    }
}

/// A job reserved from a [`RedisQueue`].
pub struct RedisJob {
    queue: RedisQueue,
    queue_name: String,
    /// The payload as it sat on the ready list
    job: String,
    /// The exact member written to the reserved set
    reserved: String,
    payload: Payload,
    state: JobState,
}

impl RedisJob {
    pub fn reserved_payload(&self) -> &str {
        &self.reserved
    }
}

#[async_trait]
impl Job for RedisJob {
    fn job_id(&self) -> JobId {
        self.payload.id.clone().unwrap_or_default()
    }

    fn raw_body(&self) -> &str {
        &self.job
    }

    fn payload(&self) -> &Payload {
        &self.payload
    }

    fn attempts(&self) -> u32 {
        self.payload.attempts.unwrap_or(1)
    }

    fn queue(&self) -> &str {
        &self.queue_name
    }

    fn connection_name(&self) -> &str {
        &self.queue.connection_name
    }

    fn state(&self) -> &JobState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut JobState {
        &mut self.state
    }

    async fn delete(&mut self) -> Result<()> {
        self.state.mark_deleted();
        let mut conn = self.queue.conn.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(reserved_key(&queue_key(&self.queue_name)))
            .arg(&self.reserved)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&mut self, delay: Duration) -> Result<()> {
        self.state.mark_released();
        let key = queue_key(&self.queue_name);
        let mut conn = self.queue.conn.clone();
        let _: i64 = self
            .queue
            .scripts
            .release
            .key(delayed_key(&key))
            .key(reserved_key(&key))
            .arg(&self.reserved)
            .arg(unix_now().saturating_add(delay_secs(delay)))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_layout() {
        let key = queue_key("emails");
        assert_eq!(key, "queues:emails");
        assert_eq!(delayed_key(&key), "queues:emails:delayed");
        assert_eq!(reserved_key(&key), "queues:emails:reserved");
    }

    #[test]
    fn test_zero_block_for_polls() {
        assert_eq!(RedisOptions::default().blocking_window(), None);
        let zero = RedisOptions::default().with_block_for(Some(0));
        assert_eq!(zero.blocking_window(), None);
        let five = RedisOptions::default().with_block_for(Some(5));
        assert_eq!(five.blocking_window(), Some(5));
    }

    #[test]
    fn test_redis_payload_adds_id_and_attempts() {
        let raw = redis_payload(&Payload::new("send_email", json!({"to": "a@b.c"}))).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["attempts"], 0);
        let id = value["id"].as_str().unwrap();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(payload_id(&raw), id);
    }

    #[test]
    fn test_attempts_bump_keeps_empty_arrays() {
        let raw = redis_payload(&Payload::new("tag", json!({"tags": [], "n": 1}))).unwrap();
        assert!(raw.ends_with(r#""attempts":0}"#));

        let once = increment_attempts(&raw).unwrap();
        let twice = increment_attempts(&once).unwrap();
        assert!(twice.ends_with(r#""attempts":2}"#));
        assert_eq!(twice.replace(r#""attempts":2}"#, ""), raw.replace(r#""attempts":0}"#, ""));

        let payload = Payload::decode(&twice).unwrap();
        assert_eq!(payload.attempts, Some(2));
        assert_eq!(payload.data["tags"], json!([]));
    }

    #[test]
    fn test_increment_attempts() {
        let raw = r#"{"job":"x","data":{},"attempts":2,"id":"abc"}"#;
        let bumped: Value = serde_json::from_str(&increment_attempts(raw).unwrap()).unwrap();
        assert_eq!(bumped["attempts"], 3);
        assert_eq!(bumped["id"], "abc");

        assert!(increment_attempts("[1,2]").is_err());
    }

    #[test]
    fn test_reservation_expiry_defaults_to_sixty_seconds() {
        let options = RedisOptions::default().with_retry_after(None);
        assert_eq!(options.reservation_expiry(1_000), 1_060);

        let options = options.with_retry_after(Some(5));
        assert_eq!(options.reservation_expiry(1_000), 1_005);
    }

    #[test]
    fn test_payload_id_missing() {
        assert_eq!(payload_id(r#"{"job":"x"}"#), "");
        assert_eq!(payload_id("garbage"), "");
    }
}
