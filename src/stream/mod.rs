//! Durable log abstraction.
//!
//! This module contains:
//! - `DurableLog` trait: append, consumer-group bootstrap, delivery,
//!   pending inspection, ownership transfer (claim), acknowledgement
//! - `StreamEntry` / `PendingEntry` types
//! - Implementations: Redis Streams, in-memory (tests)
//!
//! The log is the sole arbiter of which consumer owns which entry; claim is
//! the only cross-consumer coordination primitive.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::StreamConfig;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryDurableLog;

#[cfg(feature = "redis")]
pub use self::redis::RedisDurableLog;

/// Result type for log operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that can occur during log operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[cfg(feature = "redis")]
    #[error("Log I/O error: {0}")]
    Io(#[from] ::redis::RedisError),

    #[error("Consumer group creation failed: {0}")]
    GroupCreate(String),

    #[error("Unknown consumer group '{group}' on stream '{stream}'")]
    UnknownGroup { stream: String, group: String },

    #[error("Malformed log reply: {0}")]
    MalformedReply(String),
}

impl StreamError {
    /// Transient errors are retried with backoff by the dispatcher;
    /// everything else is a configuration problem and bubbles up.
    pub fn is_transient(&self) -> bool {
        match self {
            StreamError::Connection(_) => true,
            #[cfg(feature = "redis")]
            StreamError::Io(_) => true,
            StreamError::GroupCreate(_)
            | StreamError::UnknownGroup { .. }
            | StreamError::MalformedReply(_) => false,
        }
    }
}

/// Cursor that delivers the whole stream history to a fresh group.
pub const START_FROM_BEGINNING: &str = "0";

/// An immutable record appended to the log.
///
/// `id` is log-assigned, `<ms-timestamp>-<sequence>`, monotonically
/// increasing within a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

/// Log-tracked metadata for a delivered-but-unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    /// Consumer currently owning the entry.
    pub consumer: String,
    /// Time since the entry was last delivered to its owner.
    pub idle: Duration,
    /// Incremented on every claim or redelivery.
    pub delivery_count: u64,
}

/// Interface to the durable, partitioned append-only log.
///
/// All operations are I/O waits; implementations hold no in-process lock
/// across them.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append an entry; the log assigns and returns the entry id.
    async fn append(&self, stream: &str, fields: &BTreeMap<String, String>) -> Result<String>;

    /// Create the consumer group if absent, starting at `start_id`.
    /// Creating a group that already exists is not an error.
    async fn ensure_group(&self, stream: &str, group: &str, start_id: &str) -> Result<()>;

    /// Read up to `count` never-before-delivered entries for `consumer`,
    /// blocking up to `block` when the stream is idle. Delivered entries
    /// become pending under `consumer` until acknowledged.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Re-read up to `count` of `consumer`'s own pending entries.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// List pending-entry metadata for the whole group.
    async fn list_pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>>;

    /// Transfer ownership of `ids` to `new_owner`, skipping entries idle
    /// for less than `min_idle`. Returns the claimed entries.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_owner: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge processed entries; returns how many were still pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64>;
}

/// Initialize the durable log from configuration.
#[cfg(feature = "redis")]
pub async fn init_stream(config: &StreamConfig) -> Result<Arc<dyn DurableLog>> {
    let log = RedisDurableLog::new(&config.url).await?;
    info!(url = %config.url, stream = %config.stream, "Durable log initialized");
    Ok(Arc::new(log))
}

#[cfg(not(feature = "redis"))]
pub async fn init_stream(_config: &StreamConfig) -> Result<Arc<dyn DurableLog>> {
    Err(StreamError::Connection(
        "Redis support requires the 'redis' feature. Rebuild with --features redis".to_string(),
    ))
}
