//! MongoDB DedupStore implementation.
//!
//! The unique sparse indexes on `correlationId` and `entryId` are the
//! race-safety mechanism: of two consumers applying the same entry, exactly
//! one insert succeeds and the loser sees duplicate-key error 11000.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use tracing::info;

use super::{DedupError, DedupStore, LogEntry, LogPage, LogQuery, Result, TimeSeriesPoint};
use crate::event::EventData;

/// Collection holding the applied-event projection.
const LOGS_COLLECTION: &str = "event_logs";

/// MongoDB implementation of DedupStore.
pub struct MongoDedupStore {
    logs: Collection<Document>,
}

impl MongoDedupStore {
    /// Create a new MongoDB dedup store and ensure its indexes.
    pub async fn new(client: &Client, database_name: &str) -> Result<Self> {
        let database = client.database(database_name);
        let logs = database.collection(LOGS_COLLECTION);

        let store = Self { logs };
        store.init().await?;

        info!(
            database = %database_name,
            collection = %LOGS_COLLECTION,
            "Dedup store indexes ready"
        );

        Ok(store)
    }

    /// Initialize query indexes and the uniqueness constraints.
    async fn init(&self) -> Result<()> {
        for keys in [
            doc! { "timestamp": -1 },
            doc! { "event": 1 },
            doc! { "service": 1 },
            doc! { "createdAt": -1 },
        ] {
            let index = IndexModel::builder().keys(keys).build();
            self.logs.create_index(index).await?;
        }

        // The arbiters: at most one record per correlation id / entry id.
        for keys in [doc! { "correlationId": 1 }, doc! { "entryId": 1 }] {
            let index = IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).sparse(true).build())
                .build();
            self.logs.create_index(index).await?;
        }

        Ok(())
    }

    fn entry_to_document(entry: &LogEntry) -> Result<Document> {
        let data = mongodb::bson::to_bson(&entry.data)
            .map_err(|e| DedupError::Serialization(e.to_string()))?;

        let mut document = doc! {
            "event": &entry.event,
            "data": data,
            "timestamp": entry.timestamp,
            "service": &entry.service,
            "createdAt": mongodb::bson::DateTime::from_millis(entry.created_at.timestamp_millis()),
            "correlationId": &entry.correlation_id,
            "entryId": &entry.entry_id,
            "processedBy": &entry.processed_by,
        };
        if let Some(ref instance_id) = entry.instance_id {
            document.insert("instanceId", instance_id);
        }

        Ok(document)
    }

    fn entry_from_document(document: Document) -> Result<LogEntry> {
        let malformed = |field: &str| {
            DedupError::Malformed(format!("missing or mistyped field '{}'", field))
        };

        let data: EventData = mongodb::bson::from_bson(
            document.get("data").cloned().unwrap_or(Bson::Null),
        )
        .map_err(|e| DedupError::Malformed(e.to_string()))?;

        let created_at = document
            .get_datetime("createdAt")
            .map(|dt| {
                DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or_else(Utc::now)
            })
            .map_err(|_| malformed("createdAt"))?;

        Ok(LogEntry {
            event: document
                .get_str("event")
                .map_err(|_| malformed("event"))?
                .to_string(),
            data,
            timestamp: document
                .get_i64("timestamp")
                .map_err(|_| malformed("timestamp"))?,
            service: document
                .get_str("service")
                .map_err(|_| malformed("service"))?
                .to_string(),
            created_at,
            correlation_id: document
                .get_str("correlationId")
                .map_err(|_| malformed("correlationId"))?
                .to_string(),
            entry_id: document
                .get_str("entryId")
                .map_err(|_| malformed("entryId"))?
                .to_string(),
            instance_id: document.get_str("instanceId").ok().map(str::to_string),
            processed_by: document
                .get_str("processedBy")
                .map_err(|_| malformed("processedBy"))?
                .to_string(),
        })
    }

    fn query_filter(query: &LogQuery) -> Document {
        let mut filter = doc! {};
        if let Some(ref event_type) = query.event_type {
            filter.insert("event", event_type);
        }
        let mut window = doc! {};
        if let Some(from) = query.from_ms {
            window.insert("$gte", from);
        }
        if let Some(to) = query.to_ms {
            window.insert("$lte", to);
        }
        if !window.is_empty() {
            filter.insert("timestamp", window);
        }
        filter
    }

    fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
        if let mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(
            ref write_err,
        )) = *error.kind
        {
            return write_err.code == 11000;
        }
        false
    }
}

#[async_trait]
impl DedupStore for MongoDedupStore {
    async fn insert_unique(&self, entry: LogEntry) -> Result<()> {
        let document = Self::entry_to_document(&entry)?;

        self.logs.insert_one(document).await.map_err(|e| {
            if Self::is_duplicate_key(&e) {
                DedupError::Duplicate
            } else {
                DedupError::from(e)
            }
        })?;

        Ok(())
    }

    async fn is_processed(&self, correlation_id: &str, entry_id: &str) -> Result<bool> {
        let filter = doc! {
            "correlationId": correlation_id,
            "entryId": entry_id,
        };

        let count = self.logs.count_documents(filter).await?;
        Ok(count > 0)
    }

    async fn query(&self, query: &LogQuery) -> Result<LogPage> {
        let filter = Self::query_filter(query);

        let total = self.logs.count_documents(filter.clone()).await?;

        let skip = query.page.saturating_sub(1) * query.limit;
        let options = FindOptions::builder()
            .sort(doc! { "timestamp": -1 })
            .skip(skip)
            .limit(query.limit as i64)
            .build();

        let mut cursor = self.logs.find(filter).with_options(options).await?;

        let mut data = Vec::new();
        while cursor.advance().await? {
            let document = cursor.deserialize_current()?;
            data.push(Self::entry_from_document(document)?);
        }

        Ok(LogPage {
            data,
            total,
            page: query.page,
            limit: query.limit,
        })
    }

    async fn time_series(
        &self,
        from_ms: i64,
        to_ms: i64,
        event_type: Option<&str>,
    ) -> Result<Vec<TimeSeriesPoint>> {
        let mut filter = doc! {
            "timestamp": { "$gte": from_ms, "$lte": to_ms },
        };
        if let Some(event_type) = event_type {
            filter.insert("event", event_type);
        }

        let options = FindOptions::builder().sort(doc! { "timestamp": 1 }).build();
        let mut cursor = self.logs.find(filter).with_options(options).await?;

        let mut points = Vec::new();
        while cursor.advance().await? {
            let document = cursor.deserialize_current()?;
            let entry = Self::entry_from_document(document)?;
            points.push(TimeSeriesPoint {
                timestamp: entry.timestamp,
                value: entry.data.duration_ms().unwrap_or(1),
                event: entry.event,
            });
        }

        Ok(points)
    }
}
