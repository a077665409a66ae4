//! Storage backend trait for abstracting the MongoDB and Redis implementations.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{BackendConfig, RateLimiterConfig};
use crate::error::Result;

use super::clock::Clock;
use super::mongo_backend::MongoBackend;
use super::record::{RateLimitDecision, RateLimitRecord};
use super::redis_backend::RedisBackend;

/// Trait for rate limit storage backends.
///
/// Implementations must make [`check_and_increment`](Self::check_and_increment)
/// a single atomic store-side operation: concurrent calls for the same key
/// each observe a distinct count. Every operation connects on demand, so a
/// backend keeps working after [`close`](Self::close).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Establish connectivity. Calling this while connected is a no-op.
    async fn initialize(&self) -> Result<()>;

    /// Count one request against `key` and decide whether it is allowed.
    ///
    /// Store failures are returned as errors; the engine decides how to degrade.
    async fn check_and_increment(
        &self,
        key: &str,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<RateLimitDecision>;

    /// Delete the record for `key`. A missing record is not an error.
    async fn reset_limit(&self, key: &str) -> Result<()>;

    /// Read the record for `key` without counting a request.
    async fn get_limit_info(&self, key: &str) -> Result<Option<RateLimitRecord>>;

    /// Release the connection.
    async fn close(&self) -> Result<()>;
}

/// Build the backend selected by `config`.
pub fn build_backend(
    config: &RateLimiterConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match &config.backend {
        BackendConfig::Mongodb {
            url,
            collection_name,
        } => Arc::new(MongoBackend::new(
            url,
            collection_name,
            config.record_ttl_seconds,
            clock,
        )?),
        BackendConfig::Redis { url, key_prefix } => Arc::new(RedisBackend::new(
            url,
            key_prefix,
            config.record_ttl_seconds,
            clock,
        )?),
    };
    Ok(backend)
}
