//! Redis Streams DurableLog implementation.
//!
//! XADD / XGROUP CREATE / XREADGROUP / XPENDING / XCLAIM / XACK over a
//! multiplexed connection. Redis tracks the group cursor and the pending
//! entries list; this adapter only translates between the wire shapes and
//! the crate's types.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{from_redis_value, AsyncCommands, Client};
use tracing::{debug, info};

use super::{DurableLog, PendingEntry, Result, StreamEntry, StreamError};

/// Upper bound on one XPENDING scan. Recovery re-runs on every process
/// start, so a backlog larger than this drains across restarts.
const PENDING_SCAN_COUNT: usize = 1000;

/// Redis Streams durable log.
pub struct RedisDurableLog {
    conn: ConnectionManager,
}

impl RedisDurableLog {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    pub async fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis streams");

        Ok(Self { conn })
    }

    fn entry_from_stream_id(id: StreamId) -> Result<StreamEntry> {
        let entry_id = id.id;
        let mut fields = BTreeMap::new();
        for (key, value) in id.map {
            let value: String = from_redis_value(&value).map_err(|e| {
                StreamError::MalformedReply(format!(
                    "field '{}' of entry {}: {}",
                    key, entry_id, e
                ))
            })?;
            fields.insert(key, value);
        }
        Ok(StreamEntry {
            id: entry_id,
            fields,
        })
    }

    fn entries_from_read(reply: StreamReadReply) -> Result<Vec<StreamEntry>> {
        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push(Self::entry_from_stream_id(id)?);
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl DurableLog for RedisDurableLog {
    async fn append(&self, stream: &str, fields: &BTreeMap<String, String>) -> Result<String> {
        let mut conn = self.conn.clone();

        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let id: String = conn.xadd(stream, "*", &items).await?;

        debug!(stream = %stream, id = %id, "Appended entry to stream");

        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, start_id).await;

        match created {
            Ok(()) => {
                info!(
                    stream = %stream,
                    group = %group,
                    start_id = %start_id,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(StreamError::GroupCreate(e.to_string())),
        }
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();

        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &options).await?;

        Self::entries_from_read(reply)
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();

        // Id "0" re-delivers this consumer's pending entries from the start.
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        let reply: StreamReadReply = conn.xread_options(&[stream], &["0"], &options).await?;

        Self::entries_from_read(reply)
    }

    async fn list_pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();

        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", PENDING_SCAN_COUNT)
            .await?;

        let pending = reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            })
            .collect();

        Ok(pending)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_owner: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();

        let reply: StreamClaimReply = conn
            .xclaim(stream, group, new_owner, min_idle.as_millis() as usize, ids)
            .await?;

        let entries: Result<Vec<StreamEntry>> = reply
            .ids
            .into_iter()
            .map(Self::entry_from_stream_id)
            .collect();
        let entries = entries?;

        debug!(
            stream = %stream,
            group = %group,
            new_owner = %new_owner,
            requested = ids.len(),
            claimed = entries.len(),
            "Claimed pending entries"
        );

        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();

        let acked: u64 = conn.xack(stream, group, ids).await?;

        debug!(
            stream = %stream,
            group = %group,
            requested = ids.len(),
            acked = acked,
            "Acknowledged entries"
        );

        Ok(acked)
    }
}
