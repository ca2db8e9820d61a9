//! In-memory DedupStore implementation for tests.
//!
//! The mutex makes check-and-insert atomic, so the uniqueness constraint
//! holds under racing appliers exactly as the real store's does.

use tokio::sync::Mutex;

use async_trait::async_trait;

use super::{DedupError, DedupStore, LogEntry, LogPage, LogQuery, Result, TimeSeriesPoint};

/// In-memory dedup store for testing.
#[derive(Default)]
pub struct MemoryDedupStore {
    entries: Mutex<Vec<LogEntry>>,
    fail_inserts: Mutex<bool>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail with a transient error.
    pub async fn set_fail_inserts(&self, fail: bool) {
        *self.fail_inserts.lock().await = fail;
    }

    /// All stored records with this correlation id.
    pub async fn entries_for(&self, correlation_id: &str) -> Vec<LogEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    fn matches(entry: &LogEntry, query: &LogQuery) -> bool {
        if let Some(ref event_type) = query.event_type {
            if &entry.event != event_type {
                return false;
            }
        }
        if let Some(from) = query.from_ms {
            if entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = query.to_ms {
            if entry.timestamp > to {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn insert_unique(&self, entry: LogEntry) -> Result<()> {
        if *self.fail_inserts.lock().await {
            return Err(DedupError::Unavailable(
                "Injected insert failure".to_string(),
            ));
        }

        let mut entries = self.entries.lock().await;
        let conflict = entries.iter().any(|e| {
            e.correlation_id == entry.correlation_id || e.entry_id == entry.entry_id
        });
        if conflict {
            return Err(DedupError::Duplicate);
        }
        entries.push(entry);
        Ok(())
    }

    async fn is_processed(&self, correlation_id: &str, entry_id: &str) -> Result<bool> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .any(|e| e.correlation_id == correlation_id && e.entry_id == entry_id))
    }

    async fn query(&self, query: &LogQuery) -> Result<LogPage> {
        let entries = self.entries.lock().await;

        let mut matching: Vec<LogEntry> = entries
            .iter()
            .filter(|e| Self::matches(e, query))
            .cloned()
            .collect();
        matching.sort_by_key(|e| std::cmp::Reverse(e.timestamp));

        let total = matching.len() as u64;
        let skip = (query.page.saturating_sub(1) * query.limit) as usize;
        let data: Vec<LogEntry> = matching
            .into_iter()
            .skip(skip)
            .take(query.limit as usize)
            .collect();

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
        let entries = self.entries.lock().await;

        let mut matching: Vec<&LogEntry> = entries
            .iter()
            .filter(|e| e.timestamp >= from_ms && e.timestamp <= to_ms)
            .filter(|e| event_type.map_or(true, |t| e.event == t))
            .collect();
        matching.sort_by_key(|e| e.timestamp);

        Ok(matching
            .into_iter()
            .map(|e| TimeSeriesPoint {
                timestamp: e.timestamp,
                value: e.data.duration_ms().unwrap_or(1),
                event: e.event.clone(),
            })
            .collect())
    }
}
