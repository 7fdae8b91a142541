//! Redis transport.
//!
//! Each queue maps to three keys under a common prefix:
//!
//! - `{prefix}:{queue}:pending` - list of visible messages (LPUSH in, RPOP out)
//! - `{prefix}:{queue}:inflight` - hash of fetched messages by receipt
//! - `{prefix}:{queue}:deadlines` - sorted set of receipts by visibility deadline
//!
//! Fetch and requeue run as Lua scripts so that several worker processes can
//! share one queue without losing or duplicating messages.

use super::{BatchSendResult, DEFAULT_VISIBILITY_TIMEOUT, OutboundMessage, QueueMessage, Transport};
use crate::error::{DockhandError, DockhandResult};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;
use tracing::{debug, info};

/// Interval between fetch attempts while long polling
const LONG_POLL_STEP: Duration = Duration::from_millis(100);

/// Message as stored in Redis
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    message_id: String,
    body: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

/// Lua scripts for atomic queue operations
#[derive(Debug)]
struct RedisScripts {
    /// Move expired in-flight messages back to the head of the queue
    requeue_expired: Script,
    /// Pop up to N messages and record them as in flight
    fetch: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            requeue_expired: Script::new(
                r#"
                local pending_key = KEYS[1]
                local inflight_key = KEYS[2]
                local deadlines_key = KEYS[3]
                local now = tonumber(ARGV[1])

                local expired = redis.call('ZRANGEBYSCORE', deadlines_key, 0, now)
                for i = 1, #expired do
                    local receipt = expired[i]
                    local message = redis.call('HGET', inflight_key, receipt)
                    if message then
                        redis.call('RPUSH', pending_key, message)
                        redis.call('HDEL', inflight_key, receipt)
                    end
                    redis.call('ZREM', deadlines_key, receipt)
                end
                return #expired
                "#,
            ),
            fetch: Script::new(
                r#"
                local pending_key = KEYS[1]
                local inflight_key = KEYS[2]
                local deadlines_key = KEYS[3]
                local visible_at = tonumber(ARGV[1])

                local out = {}
                for i = 2, #ARGV do
                    local message = redis.call('RPOP', pending_key)
                    if not message then
                        break
                    end
                    local receipt = ARGV[i]
                    redis.call('HSET', inflight_key, receipt, message)
                    redis.call('ZADD', deadlines_key, visible_at, receipt)
                    table.insert(out, receipt)
                    table.insert(out, message)
                end
                return out
                "#,
            ),
        }
    }
}

/// Redis transport implementation
pub struct RedisTransport {
    /// Redis connection manager
    conn: ConnectionManager,
    /// Key prefix shared by every queue
    key_prefix: String,
    /// How long a fetched message stays invisible without an ack
    visibility_timeout: Duration,
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("key_prefix", &self.key_prefix)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisTransport {
    /// Connect with the default `dockhand` prefix and a one hour visibility timeout.
    pub async fn new(connection_string: &str) -> DockhandResult<Self> {
        Self::with_options(connection_string, "dockhand", DEFAULT_VISIBILITY_TIMEOUT).await
    }

    /// Connect with a custom key prefix and visibility timeout.
    pub async fn with_options(
        connection_string: &str,
        key_prefix: impl Into<String>,
        visibility_timeout: Duration,
    ) -> DockhandResult<Self> {
        let client = Client::open(connection_string)
            .map_err(|e| DockhandError::transport("Failed to create Redis client", e))?;

        let conn = timeout(Duration::from_secs(10), client.get_connection_manager())
            .await
            .map_err(|e| DockhandError::transport("Timed out connecting to Redis", e))?
            .map_err(|e| DockhandError::transport("Failed to create Redis connection manager", e))?;

        let key_prefix = key_prefix.into();
        info!(prefix = %key_prefix, "Connected to Redis transport");

        Ok(Self {
            conn,
            key_prefix,
            visibility_timeout,
            scripts: RedisScripts::new(),
        })
    }

    fn pending_key(&self, queue: &str) -> String {
        format!("{}:{}:pending", self.key_prefix, queue)
    }

    fn inflight_key(&self, queue: &str) -> String {
        format!("{}:{}:inflight", self.key_prefix, queue)
    }

    fn deadlines_key(&self, queue: &str) -> String {
        format!("{}:{}:deadlines", self.key_prefix, queue)
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    async fn requeue_expired(&self, queue: &str) -> DockhandResult<()> {
        let mut conn = self.conn.clone();
        let requeued: i64 = self
            .scripts
            .requeue_expired
            .key(self.pending_key(queue))
            .key(self.inflight_key(queue))
            .key(self.deadlines_key(queue))
            .arg(Self::now_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DockhandError::transport("Failed to requeue expired messages", e))?;

        if requeued > 0 {
            debug!(queue, requeued, "Visibility timeout expired, messages visible again");
        }
        Ok(())
    }

    async fn fetch_once(&self, queue: &str, max: usize) -> DockhandResult<Vec<QueueMessage>> {
        let mut conn = self.conn.clone();
        let visible_at = Self::now_millis() + self.visibility_timeout.as_millis() as u64;

        let mut invocation = self.scripts.fetch.prepare_invoke();
        invocation
            .key(self.pending_key(queue))
            .key(self.inflight_key(queue))
            .key(self.deadlines_key(queue))
            .arg(visible_at);
        for _ in 0..max {
            invocation.arg(uuid::Uuid::new_v4().to_string());
        }

        let raw: Vec<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DockhandError::transport("Failed to fetch messages", e))?;

        raw.chunks(2)
            .filter(|pair| pair.len() == 2)
            .map(|pair| {
                let stored: StoredMessage = serde_json::from_str(&pair[1])?;
                Ok(QueueMessage {
                    message_id: stored.message_id,
                    receipt: pair[0].clone(),
                    body: stored.body,
                    attributes: stored.attributes,
                })
            })
            .collect()
    }

    /// Number of visible messages in `queue`.
    pub async fn pending_len(&self, queue: &str) -> DockhandResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(self.pending_key(queue)).await?;
        Ok(len)
    }

    /// Delete every key of `queue`.
    pub async fn purge(&self, queue: &str) -> DockhandResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .del(self.pending_key(queue))
            .del(self.inflight_key(queue))
            .del(self.deadlines_key(queue))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn fetch_batch(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> DockhandResult<Vec<QueueMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + wait;
        loop {
            self.requeue_expired(queue).await?;
            let batch = self.fetch_once(queue, max).await?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(LONG_POLL_STEP.min(deadline - Instant::now())).await;
        }
    }

    async fn send_message(
        &self,
        queue: &str,
        body: String,
        attributes: HashMap<String, String>,
    ) -> DockhandResult<String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let stored = serde_json::to_string(&StoredMessage {
            message_id: message_id.clone(),
            body,
            attributes,
        })?;

        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(self.pending_key(queue), stored)
            .await
            .map_err(|e| DockhandError::transport("Failed to send message", e))?;

        debug!(queue, %message_id, "Message sent");
        Ok(message_id)
    }

    async fn send_message_batch(
        &self,
        queue: &str,
        entries: Vec<OutboundMessage>,
    ) -> DockhandResult<BatchSendResult> {
        let mut pipe = redis::pipe();
        let mut ids = Vec::with_capacity(entries.len());

        for entry in entries {
            let stored = serde_json::to_string(&StoredMessage {
                message_id: uuid::Uuid::new_v4().to_string(),
                body: entry.body,
                attributes: entry.attributes,
            })?;
            pipe.lpush(self.pending_key(queue), stored).ignore();
            ids.push(entry.id);
        }

        let mut conn = self.conn.clone();
        match pipe.query_async::<()>(&mut conn).await {
            Ok(()) => Ok(BatchSendResult {
                successful: ids,
                failed: Vec::new(),
            }),
            Err(e) => {
                let reason = e.to_string();
                Ok(BatchSendResult {
                    successful: Vec::new(),
                    failed: ids.into_iter().map(|id| (id, reason.clone())).collect(),
                })
            }
        }
    }

    async fn ack(&self, queue: &str, receipt: &str) -> DockhandResult<()> {
        let mut conn = self.conn.clone();
        let (removed, _): (i64, i64) = redis::pipe()
            .hdel(self.inflight_key(queue), receipt)
            .zrem(self.deadlines_key(queue), receipt)
            .query_async(&mut conn)
            .await
            .map_err(|e| DockhandError::transport("Failed to ack message", e))?;

        if removed == 0 {
            return Err(DockhandError::TransportError {
                message: format!("Unknown or expired receipt for queue '{}'", queue),
                source: None,
            });
        }
        Ok(())
    }

    async fn health_check(&self) -> DockhandResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| DockhandError::transport("Redis health check failed", e))?;

        if pong != "PONG" {
            return Err(DockhandError::TransportError {
                message: format!("Unexpected PING reply: {}", pong),
                source: None,
            });
        }
        Ok(())
    }

    fn visibility_timeout(&self) -> Option<Duration> {
        Some(self.visibility_timeout)
    }
}
