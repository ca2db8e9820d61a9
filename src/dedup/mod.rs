//! Idempotent apply and the consumer-side projection store.
//!
//! This module contains:
//! - `LogEntry`: the stored, queryable result of an applied event
//! - `DedupStore` trait: unique-constrained insert plus query surface
//! - `IdempotentApplier`: the dedup check + side-effecting write that the
//!   dispatcher and the recovery path both funnel through
//!
//! The check-then-insert pair is not atomic; the store-level uniqueness
//! constraint is the true arbiter under racing appliers, and the pre-check
//! only avoids pointless write attempts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::DedupConfig;
use crate::context::ProcessContext;
use crate::event::{Event, EventData};

pub mod memory;

#[cfg(feature = "mongodb")]
pub mod mongodb;

pub use memory::MemoryDedupStore;

#[cfg(feature = "mongodb")]
pub use self::mongodb::MongoDedupStore;

/// Result type for dedup-store operations.
pub type Result<T> = std::result::Result<T, DedupError>;

/// Errors that can occur during dedup-store operations.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Unique constraint hit: the record was already applied. This is the
    /// expected outcome of a claim race, not a failure.
    #[error("Record already applied")]
    Duplicate,

    #[cfg(feature = "mongodb")]
    #[error("Store I/O error: {0}")]
    Store(#[from] ::mongodb::error::Error),

    #[error("Failed to encode record: {0}")]
    Serialization(String),

    #[error("Malformed stored record: {0}")]
    Malformed(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl DedupError {
    /// Transient errors leave the source entry pending for a later retry.
    pub fn is_transient(&self) -> bool {
        match self {
            DedupError::Duplicate | DedupError::Serialization(_) | DedupError::Malformed(_) => {
                false
            }
            #[cfg(feature = "mongodb")]
            DedupError::Store(_) => true,
            DedupError::Unavailable(_) => true,
        }
    }
}

/// Stored, queryable projection of an applied event.
///
/// One record per unique correlation/entry id, enforced by the store's
/// uniqueness constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Event type.
    pub event: String,
    /// Event payload.
    pub data: EventData,
    /// Publish time, ms since epoch.
    pub timestamp: i64,
    /// Origin service.
    pub service: String,
    /// Publish time as a date, for human-facing queries.
    pub created_at: DateTime<Utc>,
    /// Idempotency key (resolved: business id or entry-id fallback).
    pub correlation_id: String,
    /// Log-assigned entry id.
    pub entry_id: String,
    /// Instance that published the event.
    pub instance_id: Option<String>,
    /// Instance that applied the event.
    pub processed_by: String,
}

/// Filter and pagination for projection queries.
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub event_type: Option<String>,
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
    /// 1-based page number.
    pub page: u64,
    pub limit: u64,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            event_type: None,
            from_ms: None,
            to_ms: None,
            page: 1,
            limit: 10,
        }
    }
}

/// One page of projection query results.
#[derive(Debug, Clone)]
pub struct LogPage {
    pub data: Vec<LogEntry>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

/// A single point derived from applied events for charting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSeriesPoint {
    pub timestamp: i64,
    pub value: i64,
    pub event: String,
}

/// Interface to the unique-constrained projection store.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Insert a record, failing with `DedupError::Duplicate` when the
    /// correlation id or entry id already exists.
    async fn insert_unique(&self, entry: LogEntry) -> Result<()>;

    /// Whether a record with this correlation id and entry id exists.
    /// An optimization only; `insert_unique` remains the arbiter.
    async fn is_processed(&self, correlation_id: &str, entry_id: &str) -> Result<bool>;

    /// Query applied events, newest first.
    async fn query(&self, query: &LogQuery) -> Result<LogPage>;

    /// Per-event data points in `[from_ms, to_ms]`, oldest first.
    /// The value is the payload's duration, or 1 when it carries none.
    async fn time_series(
        &self,
        from_ms: i64,
        to_ms: i64,
        event_type: Option<&str>,
    ) -> Result<Vec<TimeSeriesPoint>>;
}

/// Outcome of an idempotent apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// This call performed the side-effecting write.
    Applied,
    /// The record already existed (earlier delivery or a lost race).
    Duplicate,
}

/// The side-effecting write both the dispatcher and recovery funnel through.
///
/// Safe to call any number of times for the same logical key; at most one
/// call across all racing consumers ends up `Applied`.
pub struct IdempotentApplier {
    store: Arc<dyn DedupStore>,
    ctx: Arc<ProcessContext>,
}

impl IdempotentApplier {
    pub fn new(store: Arc<dyn DedupStore>, ctx: Arc<ProcessContext>) -> Self {
        Self { store, ctx }
    }

    pub fn store(&self) -> &Arc<dyn DedupStore> {
        &self.store
    }

    /// Apply `event`, keyed by the resolved `correlation_id` (with
    /// `entry_id` as the secondary key).
    pub async fn apply(
        &self,
        entry_id: &str,
        correlation_id: &str,
        event: &Event,
    ) -> Result<ApplyOutcome> {
        if self.store.is_processed(correlation_id, entry_id).await? {
            return Ok(ApplyOutcome::Duplicate);
        }

        let entry = LogEntry {
            event: event.event_type.clone(),
            data: event.data.clone(),
            timestamp: event.timestamp,
            service: event.service.clone(),
            created_at: DateTime::from_timestamp_millis(event.timestamp)
                .unwrap_or_else(Utc::now),
            correlation_id: correlation_id.to_string(),
            entry_id: entry_id.to_string(),
            instance_id: event.instance_id.clone(),
            processed_by: self.ctx.instance_id().to_string(),
        };

        match self.store.insert_unique(entry).await {
            Ok(()) => Ok(ApplyOutcome::Applied),
            // Lost the race to a sibling consumer between check and insert.
            Err(DedupError::Duplicate) => Ok(ApplyOutcome::Duplicate),
            Err(e) => Err(e),
        }
    }
}

/// Initialize the dedup store from configuration.
#[cfg(feature = "mongodb")]
pub async fn init_dedup(config: &DedupConfig) -> Result<Arc<dyn DedupStore>> {
    let client = ::mongodb::Client::with_uri_str(&config.uri).await?;
    let store = MongoDedupStore::new(&client, &config.database).await?;

    info!(database = %config.database, "Dedup store initialized");

    Ok(Arc::new(store))
}

#[cfg(not(feature = "mongodb"))]
pub async fn init_dedup(_config: &DedupConfig) -> Result<Arc<dyn DedupStore>> {
    Err(DedupError::Unavailable(
        "MongoDB support requires the 'mongodb' feature. Rebuild with --features mongodb"
            .to_string(),
    ))
}
