//! Redis-backed rate limit storage.
//!
//! Each key is a hash with `count`, `resetAt` and `createdAt` fields (epoch
//! milliseconds). The fixed-window rule runs inside a Lua script, so the read
//! and the write happen as one atomic step on the server.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Script};
use tracing::{error, info, warn};

use crate::error::{RateLimitError, Result};

use super::backend::StorageBackend;
use super::clock::Clock;
use super::connection::LazyConnection;
use super::counter::WindowCounter;
use super::record::{RateLimitDecision, RateLimitRecord};

const CHECK_AND_INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])

local reset_at = tonumber(redis.call('HGET', key, 'resetAt'))
local count
local created_at

if reset_at == nil or reset_at <= now then
  count = 1
  reset_at = now + window_ms
  created_at = now
  redis.call('HSET', key, 'count', count, 'resetAt', reset_at, 'createdAt', created_at)
  redis.call('PEXPIREAT', key, created_at + ttl_ms)
else
  count = redis.call('HINCRBY', key, 'count', 1)
  created_at = tonumber(redis.call('HGET', key, 'createdAt')) or now
end

return {count, reset_at, created_at}
"#;

/// Redis implementation of the storage backend.
pub struct RedisBackend {
    client: redis::Client,
    key_prefix: String,
    record_ttl_ms: i64,
    script: Script,
    connection: LazyConnection<MultiplexedConnection>,
    clock: Arc<dyn Clock>,
}

impl RedisBackend {
    /// Create a backend for the Redis server at `url`.
    ///
    /// The URL is parsed here; nothing is contacted until first use.
    pub fn new(
        url: &str,
        key_prefix: impl Into<String>,
        record_ttl_seconds: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|error| {
            RateLimitError::Configuration(format!("invalid redis url: {error}"))
        })?;

        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            record_ttl_ms: millis(record_ttl_seconds),
            script: Script::new(CHECK_AND_INCREMENT_SCRIPT),
            connection: LazyConnection::new(),
            clock,
        })
    }

    fn key_for(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.connection
            .get_or_connect(|| async {
                let connection = self
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|error| {
                        error!(error = %error, "Failed to connect to redis");
                        RateLimitError::Connection(format!("failed to connect to redis: {error}"))
                    })?;
                info!("Redis storage backend initialized");
                Ok(connection)
            })
            .await
    }

    /// Map a failed command to an error, dropping the cached connection when
    /// the failure means it can no longer be used.
    async fn operation_error(&self, action: &str, error: RedisError) -> RateLimitError {
        if is_connection_lost(&error) && self.connection.invalidate().await {
            warn!(error = %error, "Redis connection lost, reconnecting on next use");
        }
        RateLimitError::BackendOperation(format!("failed to {action}: {error}"))
    }
}

fn is_connection_lost(error: &RedisError) -> bool {
    error.is_io_error() || error.is_connection_dropped() || error.is_unrecoverable_error()
}

#[async_trait]
impl StorageBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn initialize(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn check_and_increment(
        &self,
        key: &str,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<RateLimitDecision> {
        let counter = WindowCounter::new(max_requests, window_seconds);
        let now = self.clock.now();
        let mut connection = self.connection().await?;

        let result: redis::RedisResult<(i64, i64, i64)> = self
            .script
            .key(self.key_for(key))
            .arg(now.timestamp_millis())
            .arg(counter.window().num_milliseconds())
            .arg(self.record_ttl_ms)
            .invoke_async(&mut connection)
            .await;
        let (count, reset_at_ms, created_at_ms) = match result {
            Ok(reply) => reply,
            Err(error) => {
                return Err(self
                    .operation_error("record redis rate limit attempt", error)
                    .await)
            }
        };

        let record = RateLimitRecord {
            key: key.to_string(),
            count: u64::try_from(count).map_err(|error| {
                RateLimitError::BackendOperation(format!("invalid redis count: {error}"))
            })?,
            reset_at: timestamp(reset_at_ms)?,
            created_at: timestamp(created_at_ms)?,
        };

        Ok(counter.decide(&record))
    }

    async fn reset_limit(&self, key: &str) -> Result<()> {
        let mut connection = self.connection().await?;
        let result: redis::RedisResult<i64> = redis::cmd("DEL")
            .arg(self.key_for(key))
            .query_async(&mut connection)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(error) => Err(self.operation_error("reset redis rate limit", error).await),
        }
    }

    async fn get_limit_info(&self, key: &str) -> Result<Option<RateLimitRecord>> {
        let mut connection = self.connection().await?;
        let result: redis::RedisResult<(Option<i64>, Option<i64>, Option<i64>)> =
            redis::cmd("HMGET")
                .arg(self.key_for(key))
                .arg("count")
                .arg("resetAt")
                .arg("createdAt")
                .query_async(&mut connection)
                .await;
        let (count, reset_at_ms, created_at_ms) = match result {
            Ok(fields) => fields,
            Err(error) => return Err(self.operation_error("read redis rate limit", error).await),
        };

        let (Some(count), Some(reset_at_ms), Some(created_at_ms)) =
            (count, reset_at_ms, created_at_ms)
        else {
            return Ok(None);
        };

        Ok(Some(RateLimitRecord {
            key: key.to_string(),
            count: u64::try_from(count).map_err(|error| {
                RateLimitError::BackendOperation(format!("invalid redis count: {error}"))
            })?,
            reset_at: timestamp(reset_at_ms)?,
            created_at: timestamp(created_at_ms)?,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.connection.close().await.is_some() {
            info!("Redis storage backend closed");
        }
        Ok(())
    }
}

fn millis(seconds: u64) -> i64 {
    i64::try_from(seconds)
        .unwrap_or(i64::MAX)
        .saturating_mul(1_000)
}

fn timestamp(epoch_ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(epoch_ms).ok_or_else(|| {
        RateLimitError::BackendOperation(format!("invalid redis timestamp: {epoch_ms}"))
    })
}
