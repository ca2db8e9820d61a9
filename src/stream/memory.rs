//! In-memory DurableLog implementation for tests.
//!
//! Models the full delivery contract: group cursors, pending ownership,
//! idle-gated claims, and acknowledgement. Consumer tests exercise crash
//! and race scenarios against the real rules without a server.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use super::{DurableLog, PendingEntry, Result, StreamEntry, StreamError};

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    cursor: usize,
    pending: HashMap<String, PendingState>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
    last_ms: i64,
    last_seq: u64,
}

impl StreamState {
    fn next_id(&mut self) -> String {
        let now = Utc::now().timestamp_millis();
        if now > self.last_ms {
            self.last_ms = now;
            self.last_seq = 0;
        } else {
            // Same millisecond (or clock went backwards): bump the sequence
            // so ids stay strictly increasing.
            self.last_seq += 1;
        }
        format!("{}-{}", self.last_ms, self.last_seq)
    }
}

/// In-memory durable log for testing.
#[derive(Default)]
pub struct MemoryDurableLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
    fail_appends: Mutex<bool>,
    fail_reads: Mutex<u32>,
}

impl MemoryDurableLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail, for publish-failure tests.
    pub async fn set_fail_appends(&self, fail: bool) {
        *self.fail_appends.lock().await = fail;
    }

    /// Make the next `n` reads fail with a transient error.
    pub async fn fail_next_reads(&self, n: u32) {
        *self.fail_reads.lock().await = n;
    }

    /// Number of entries appended to `stream`.
    pub async fn entry_count(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    /// Number of entries `group` has ever taken delivery of.
    pub async fn delivered_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.cursor)
            .unwrap_or(0)
    }

    /// Number of delivered-but-unacknowledged entries in `group`.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn sort_by_id(entries: &mut [StreamEntry]) {
        entries.sort_by_key(|e| parse_entry_id(&e.id));
    }
}

fn parse_entry_id(id: &str) -> (i64, u64) {
    match id.split_once('-') {
        Some((ms, seq)) => (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
        None => (id.parse().unwrap_or(0), 0),
    }
}

#[async_trait]
impl DurableLog for MemoryDurableLog {
    async fn append(&self, stream: &str, fields: &BTreeMap<String, String>) -> Result<String> {
        if *self.fail_appends.lock().await {
            return Err(StreamError::Connection(
                "Injected append failure".to_string(),
            ));
        }

        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();

        let id = state.next_id();
        state.entries.push(StreamEntry {
            id: id.clone(),
            fields: fields.clone(),
        });
        drop(streams);

        self.appended.notify_waiters();

        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start_id: &str) -> Result<()> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();

        if state.groups.contains_key(group) {
            return Ok(());
        }

        let cursor = if start_id == "$" {
            state.entries.len()
        } else {
            let start = parse_entry_id(start_id);
            state
                .entries
                .iter()
                .take_while(|e| parse_entry_id(&e.id) <= start)
                .count()
        };

        state.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: HashMap::new(),
            },
        );

        Ok(())
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        {
            let mut fail_reads = self.fail_reads.lock().await;
            if *fail_reads > 0 {
                *fail_reads -= 1;
                return Err(StreamError::Connection(
                    "Injected read failure".to_string(),
                ));
            }
        }

        let deadline = Instant::now() + block;

        loop {
            {
                let mut streams = self.streams.lock().await;
                let state = streams
                    .get_mut(stream)
                    .ok_or_else(|| StreamError::UnknownGroup {
                        stream: stream.to_string(),
                        group: group.to_string(),
                    })?;
                let StreamState {
                    entries, groups, ..
                } = state;
                let group_state =
                    groups
                        .get_mut(group)
                        .ok_or_else(|| StreamError::UnknownGroup {
                            stream: stream.to_string(),
                            group: group.to_string(),
                        })?;

                if group_state.cursor < entries.len() {
                    let take = count.min(entries.len() - group_state.cursor);
                    let batch: Vec<StreamEntry> = entries
                        [group_state.cursor..group_state.cursor + take]
                        .to_vec();
                    for entry in &batch {
                        group_state.pending.insert(
                            entry.id.clone(),
                            PendingState {
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                                delivery_count: 1,
                            },
                        );
                    }
                    group_state.cursor += take;
                    return Ok(batch);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // A wakeup racing the lock release only delays delivery to the
            // next poll; the deadline still bounds the wait.
            let _ = tokio::time::timeout(remaining, self.appended.notified()).await;
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let streams = self.streams.lock().await;
        let state = streams
            .get(stream)
            .ok_or_else(|| StreamError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| StreamError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let mut entries: Vec<StreamEntry> = state
            .entries
            .iter()
            .filter(|e| {
                group_state
                    .pending
                    .get(&e.id)
                    .is_some_and(|p| p.consumer == consumer)
            })
            .cloned()
            .collect();

        Self::sort_by_id(&mut entries);
        entries.truncate(count);

        Ok(entries)
    }

    async fn list_pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>> {
        let streams = self.streams.lock().await;
        let state = streams
            .get(stream)
            .ok_or_else(|| StreamError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| StreamError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let mut pending: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .map(|(id, p)| PendingEntry {
                id: id.clone(),
                consumer: p.consumer.clone(),
                idle: p.delivered_at.elapsed(),
                delivery_count: p.delivery_count,
            })
            .collect();

        pending.sort_by_key(|p| parse_entry_id(&p.id));

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
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| StreamError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let mut claimed = Vec::new();
        for id in ids {
            let Some(pending) = group_state.pending.get_mut(id) else {
                // Already acknowledged (or never delivered): nothing to claim.
                continue;
            };
            if pending.delivered_at.elapsed() < min_idle {
                continue;
            }
            let Some(entry) = entries.iter().find(|e| &e.id == id) else {
                continue;
            };

            pending.consumer = new_owner.to_string();
            pending.delivered_at = Instant::now();
            pending.delivery_count += 1;
            claimed.push(entry.clone());
        }

        Self::sort_by_id(&mut claimed);

        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| StreamError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let mut acked = 0u64;
        for id in ids {
            if group_state.pending.remove(id).is_some() {
                acked += 1;
            }
        }

        Ok(acked)
    }
}
