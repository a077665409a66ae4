//! In-process backends and a controllable clock for engine tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{RateLimitError, Result};

use super::backend::StorageBackend;
use super::clock::Clock;
use super::connection::LazyConnection;
use super::counter::WindowCounter;
use super::record::{RateLimitDecision, RateLimitRecord};

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Backend keeping records in a map. Each shard lock makes the
/// read-modify-write atomic per key, like the store-side operations.
pub struct MemoryBackend {
    records: DashMap<String, RateLimitRecord>,
    connection: LazyConnection<()>,
    connects: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            connection: LazyConnection::new(),
            connects: AtomicUsize::new(0),
            clock,
        }
    }

    /// How many times a connection was established.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<()> {
        self.connection
            .get_or_connect(|| async {
                self.connects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        self.connect().await
    }

    async fn check_and_increment(
        &self,
        key: &str,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<RateLimitDecision> {
        self.connect().await?;
        let counter = WindowCounter::new(max_requests, window_seconds);
        let now = self.clock.now();

        let record = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let next = counter.advance(key, Some(entry.get()), now);
                entry.insert(next.clone());
                next
            }
            Entry::Vacant(entry) => {
                let next = counter.advance(key, None, now);
                entry.insert(next.clone());
                next
            }
        };

        Ok(counter.decide(&record))
    }

    async fn reset_limit(&self, key: &str) -> Result<()> {
        self.connect().await?;
        self.records.remove(key);
        Ok(())
    }

    async fn get_limit_info(&self, key: &str) -> Result<Option<RateLimitRecord>> {
        self.connect().await?;
        Ok(self.records.get(key).map(|record| record.value().clone()))
    }

    async fn close(&self) -> Result<()> {
        self.connection.close().await;
        Ok(())
    }
}

/// Backend that connects but fails every operation.
#[derive(Debug, Default)]
pub struct FailingBackend;

fn store_down() -> RateLimitError {
    RateLimitError::BackendOperation("store unavailable".to_string())
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn check_and_increment(&self, _: &str, _: u64, _: u64) -> Result<RateLimitDecision> {
        Err(store_down())
    }

    async fn reset_limit(&self, _: &str) -> Result<()> {
        Err(store_down())
    }

    async fn get_limit_info(&self, _: &str) -> Result<Option<RateLimitRecord>> {
        Err(store_down())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn refused() -> RateLimitError {
    RateLimitError::Connection("connection refused".to_string())
}

/// Backend whose store can never be reached.
#[derive(Debug, Default)]
pub struct UnreachableBackend;

#[async_trait]
impl StorageBackend for UnreachableBackend {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn initialize(&self) -> Result<()> {
        Err(refused())
    }

    async fn check_and_increment(&self, _: &str, _: u64, _: u64) -> Result<RateLimitDecision> {
        Err(refused())
    }

    async fn reset_limit(&self, _: &str) -> Result<()> {
        Err(refused())
    }

    async fn get_limit_info(&self, _: &str) -> Result<Option<RateLimitRecord>> {
        Err(refused())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
