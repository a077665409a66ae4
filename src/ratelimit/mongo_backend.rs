//! MongoDB-backed rate limit storage.
//!
//! One document per key. The fixed-window rule is expressed as an
//! aggregation-pipeline update inside a single `findOneAndUpdate` upsert, which
//! MongoDB applies atomically per document. A unique index on `key` keeps
//! concurrent first requests from creating duplicate documents, and a TTL index
//! on `createdAt` removes records that are no longer being used.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{RateLimitError, Result};

use super::backend::StorageBackend;
use super::clock::Clock;
use super::connection::LazyConnection;
use super::counter::WindowCounter;
use super::record::{RateLimitDecision, RateLimitRecord};

/// Database used when the connection URL does not name one.
pub const DEFAULT_DATABASE: &str = "rate_limiter";

/// Stored document layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordDocument {
    key: String,
    count: i64,
    reset_at: BsonDateTime,
    created_at: BsonDateTime,
}

impl RecordDocument {
    fn into_record(self) -> Result<RateLimitRecord> {
        Ok(RateLimitRecord {
            count: u64::try_from(self.count).map_err(|error| {
                RateLimitError::BackendOperation(format!("invalid mongodb count: {error}"))
            })?,
            reset_at: utc_datetime(self.reset_at)?,
            created_at: utc_datetime(self.created_at)?,
            key: self.key,
        })
    }
}

#[derive(Clone)]
struct MongoHandle {
    client: Client,
    collection: Collection<RecordDocument>,
}

/// MongoDB implementation of the storage backend.
pub struct MongoBackend {
    url: String,
    collection_name: String,
    record_ttl: Duration,
    connection: LazyConnection<MongoHandle>,
    clock: Arc<dyn Clock>,
}

impl MongoBackend {
    /// Create a backend for the deployment at `url`.
    ///
    /// Only the URL scheme is checked here; the full URL is parsed (and SRV
    /// records resolved) when connecting.
    pub fn new(
        url: &str,
        collection_name: impl Into<String>,
        record_ttl_seconds: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if !(url.starts_with("mongodb://") || url.starts_with("mongodb+srv://")) {
            return Err(RateLimitError::Configuration(format!(
                "invalid mongodb url: expected a mongodb:// or mongodb+srv:// scheme, got {url:?}"
            )));
        }

        Ok(Self {
            url: url.to_string(),
            collection_name: collection_name.into(),
            record_ttl: Duration::from_secs(record_ttl_seconds),
            connection: LazyConnection::new(),
            clock,
        })
    }

    async fn connect(&self) -> Result<MongoHandle> {
        let client = Client::with_uri_str(&self.url)
            .await
            .map_err(connection_error)?;
        let database = client
            .default_database()
            .unwrap_or_else(|| client.database(DEFAULT_DATABASE));

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(connection_error)?;

        let collection = database.collection::<RecordDocument>(&self.collection_name);
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! { "key": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder().keys(doc! { "resetAt": 1 }).build(),
            IndexModel::builder()
                .keys(doc! { "createdAt": 1 })
                .options(
                    IndexOptions::builder()
                        .expire_after(self.record_ttl)
                        .build(),
                )
                .build(),
        ];
        collection
            .create_indexes(indexes)
            .await
            .map_err(connection_error)?;

        info!(
            collection = %self.collection_name,
            ttl_secs = self.record_ttl.as_secs(),
            "MongoDB storage backend initialized"
        );

        Ok(MongoHandle { client, collection })
    }

    async fn collection(&self) -> Result<Collection<RecordDocument>> {
        let handle = self.connection.get_or_connect(|| self.connect()).await?;
        Ok(handle.collection)
    }
}

/// Pipeline update applying the fixed-window rule at `now`.
///
/// Inside one `$set` stage every expression sees the document as it was before
/// the update, so all three fields branch on the same condition.
fn window_update(now: DateTime<Utc>, reset_at: DateTime<Utc>) -> Vec<Document> {
    let now = bson_datetime(now);
    let reset_at = bson_datetime(reset_at);
    let expired = doc! { "$lte": [{ "$ifNull": ["$resetAt", null] }, now] };

    vec![doc! {
        "$set": {
            "count": { "$cond": [expired.clone(), 1_i64, { "$add": ["$count", 1_i64] }] },
            "resetAt": { "$cond": [expired.clone(), reset_at, "$resetAt"] },
            "createdAt": { "$cond": [expired, now, "$createdAt"] },
        }
    }]
}

#[async_trait]
impl StorageBackend for MongoBackend {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    async fn initialize(&self) -> Result<()> {
        self.collection().await.map(|_| ())
    }

    async fn check_and_increment(
        &self,
        key: &str,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<RateLimitDecision> {
        let counter = WindowCounter::new(max_requests, window_seconds);
        let now = self.clock.now();
        let collection = self.collection().await?;

        let document = collection
            .find_one_and_update(doc! { "key": key }, window_update(now, now + counter.window()))
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await
            .map_err(|error| {
                RateLimitError::BackendOperation(format!(
                    "failed to record mongodb rate limit attempt: {error}"
                ))
            })?
            .ok_or_else(|| {
                RateLimitError::BackendOperation(
                    "mongodb upsert returned no document".to_string(),
                )
            })?;

        Ok(counter.decide(&document.into_record()?))
    }

    async fn reset_limit(&self, key: &str) -> Result<()> {
        let collection = self.collection().await?;
        collection
            .delete_one(doc! { "key": key })
            .await
            .map_err(|error| {
                RateLimitError::BackendOperation(format!(
                    "failed to reset mongodb rate limit: {error}"
                ))
            })?;
        Ok(())
    }

    async fn get_limit_info(&self, key: &str) -> Result<Option<RateLimitRecord>> {
        let collection = self.collection().await?;
        collection
            .find_one(doc! { "key": key })
            .await
            .map_err(|error| {
                RateLimitError::BackendOperation(format!(
                    "failed to read mongodb rate limit: {error}"
                ))
            })?
            .map(RecordDocument::into_record)
            .transpose()
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.connection.close().await {
            handle.client.shutdown().await;
            info!("MongoDB storage backend closed");
        }
        Ok(())
    }
}

fn connection_error(error: mongodb::error::Error) -> RateLimitError {
    error!(error = %error, "Failed to initialize MongoDB storage backend");
    RateLimitError::Connection(format!("failed to connect to mongodb: {error}"))
}

fn bson_datetime(timestamp: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(timestamp.timestamp_millis())
}

fn utc_datetime(timestamp: BsonDateTime) -> Result<DateTime<Utc>> {
    let millis = timestamp.timestamp_millis();
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        RateLimitError::BackendOperation(format!("invalid mongodb timestamp: {millis}"))
    })
}
