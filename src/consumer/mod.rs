//! Consumer side of the pipeline.
//!
//! Startup runs in three phases: the consumer group is created if absent
//! (idempotently, reading from the beginning of the stream so a fresh group
//! sees all history), then one recovery pass re-applies entries left
//! pending by this identity's previous run and claims entries orphaned by
//! dead siblings, and only then does the steady-state dispatch loop start.
//!
//! The log is the sole arbiter of entry ownership; recovery and the
//! dispatcher both funnel every entry through the idempotent applier before
//! acknowledging, so a crash between apply and ack never duplicates side
//! effects.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::context::{ProcessContext, TraceContext};
use crate::dedup::{ApplyOutcome, DedupStore, IdempotentApplier};
use crate::event::{resolve_correlation_id, Event};
use crate::stream::{DurableLog, PendingEntry, StreamEntry, StreamError, START_FROM_BEGINNING};

/// Max pending entries re-read for this consumer in one recovery pass.
const RECOVERY_READ_COUNT: usize = 100;

/// Errors that can occur in the consumer.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Log error: {0}")]
    Stream(#[from] StreamError),

    #[error("Dedup store error: {0}")]
    Dedup(#[from] crate::dedup::DedupError),
}

/// Stops the dispatch loop: no new polls, the in-flight batch finishes.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// One group member: bootstraps the group, recovers orphaned entries,
/// then polls, applies, and acknowledges until stopped.
pub struct Consumer {
    log: Arc<dyn DurableLog>,
    applier: IdempotentApplier,
    ctx: Arc<ProcessContext>,
    stream: String,
    group: String,
    consumer_name: String,
    poll_count: usize,
    poll_block: Duration,
    poll_backoff: Duration,
    claim_min_idle: Duration,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Consumer {
    pub fn new(
        log: Arc<dyn DurableLog>,
        store: Arc<dyn DedupStore>,
        ctx: Arc<ProcessContext>,
        config: &StreamConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer_name = ctx.consumer_name();

        info!(
            service = %ctx.service(),
            instance = %ctx.instance_id(),
            stream = %config.stream,
            group = %config.group,
            consumer = %consumer_name,
            "Consumer initialized"
        );

        Self {
            log,
            applier: IdempotentApplier::new(store, ctx.clone()),
            ctx,
            stream: config.stream.clone(),
            group: config.group.clone(),
            consumer_name,
            poll_count: config.poll_count,
            poll_block: config.poll_block(),
            poll_backoff: config.poll_backoff(),
            claim_min_idle: config.claim_min_idle(),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// This process's identity within the group.
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Bootstrap, recover, then dispatch until stopped.
    ///
    /// Group-creation failure (other than already-exists) is fatal; recovery
    /// failures are logged and steady state is entered regardless.
    pub async fn run(self) -> Result<(), ConsumerError> {
        self.ensure_group().await?;
        self.recover().await;
        self.dispatch().await;
        Ok(())
    }

    /// Create the consumer group if it does not exist yet.
    ///
    /// The group starts at the beginning of the stream so that pre-existing
    /// history is delivered to the first consumer instead of silently
    /// skipped.
    pub async fn ensure_group(&self) -> Result<(), ConsumerError> {
        let trace = TraceContext::stage("init");

        self.log
            .ensure_group(&self.stream, &self.group, START_FROM_BEGINNING)
            .await?;

        info!(
            service = %self.ctx.service(),
            instance = %self.ctx.instance_id(),
            correlation_id = %trace.correlation_id,
            request_id = %trace.request_id,
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer_name,
            "Consumer group ready"
        );

        Ok(())
    }

    /// One-shot recovery pass, run before the first poll.
    ///
    /// Re-applies entries this identity left pending in a previous run and
    /// claims entries owned by consumers that have been idle beyond the
    /// liveness threshold. Errors are logged, never fatal: availability is
    /// favored over perfect cleanup, and anything missed stays pending for
    /// the next pass.
    pub async fn recover(&self) {
        if let Err(e) = self.try_recover().await {
            error!(
                service = %self.ctx.service(),
                instance = %self.ctx.instance_id(),
                correlation_id = "recovery",
                stream = %self.stream,
                group = %self.group,
                error = %e,
                "Error recovering pending entries"
            );
        }
    }

    async fn try_recover(&self) -> Result<(), ConsumerError> {
        let trace = TraceContext::stage("recovery");

        let all_pending = self.log.list_pending(&self.stream, &self.group).await?;

        let (own, foreign): (Vec<&PendingEntry>, Vec<&PendingEntry>) = all_pending
            .iter()
            .partition(|p| p.consumer == self.consumer_name);

        let stale: Vec<&PendingEntry> = foreign
            .into_iter()
            .filter(|p| p.idle >= self.claim_min_idle)
            .collect();

        if own.is_empty() && stale.is_empty() {
            debug!(
                service = %self.ctx.service(),
                instance = %self.ctx.instance_id(),
                correlation_id = %trace.correlation_id,
                stream = %self.stream,
                group = %self.group,
                consumer = %self.consumer_name,
                "No pending entries to recover"
            );
            return Ok(());
        }

        info!(
            service = %self.ctx.service(),
            instance = %self.ctx.instance_id(),
            correlation_id = %trace.correlation_id,
            request_id = %trace.request_id,
            total_pending = all_pending.len(),
            own = own.len(),
            stale = stale.len(),
            stream = %self.stream,
            group = %self.group,
            "Recovering pending entries"
        );

        let mut entries: Vec<StreamEntry> = Vec::new();

        // Entries this identity left behind when it last died.
        if !own.is_empty() {
            entries.extend(
                self.log
                    .read_pending(
                        &self.stream,
                        &self.group,
                        &self.consumer_name,
                        RECOVERY_READ_COUNT,
                    )
                    .await?,
            );
        }

        // Entries orphaned by dead siblings, claimed per previous owner so
        // one failing owner does not abort the rest.
        let mut by_owner: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pending in &stale {
            by_owner
                .entry(pending.consumer.clone())
                .or_default()
                .push(pending.id.clone());
        }

        for (dead_consumer, ids) in by_owner {
            info!(
                service = %self.ctx.service(),
                instance = %self.ctx.instance_id(),
                correlation_id = %trace.correlation_id,
                dead_consumer = %dead_consumer,
                count = ids.len(),
                "Claiming pending entries from idle consumer"
            );

            match self
                .log
                .claim(
                    &self.stream,
                    &self.group,
                    &self.consumer_name,
                    self.claim_min_idle,
                    &ids,
                )
                .await
            {
                Ok(claimed) => {
                    info!(
                        correlation_id = %trace.correlation_id,
                        dead_consumer = %dead_consumer,
                        claimed = claimed.len(),
                        "Claimed pending entries"
                    );
                    entries.extend(claimed);
                }
                Err(e) => {
                    warn!(
                        correlation_id = %trace.correlation_id,
                        dead_consumer = %dead_consumer,
                        count = ids.len(),
                        error = %e,
                        "Failed to claim pending entries"
                    );
                }
            }
        }

        for entry in &entries {
            self.handle_entry(entry).await;
        }

        info!(
            service = %self.ctx.service(),
            instance = %self.ctx.instance_id(),
            correlation_id = %trace.correlation_id,
            recovered = entries.len(),
            "Finished recovering pending entries"
        );

        Ok(())
    }

    /// Steady-state dispatch loop.
    ///
    /// Polls never re-deliver history (that is recovery's job). A failed
    /// poll backs off briefly and retries; only the stop signal ends the
    /// loop, and the batch in flight is finished first.
    async fn dispatch(&self) {
        info!(
            service = %self.ctx.service(),
            instance = %self.ctx.instance_id(),
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer_name,
            "Dispatcher started"
        );

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self
                .log
                .read_new(
                    &self.stream,
                    &self.group,
                    &self.consumer_name,
                    self.poll_count,
                    self.poll_block,
                )
                .await
            {
                Ok(entries) => {
                    for entry in &entries {
                        self.handle_entry(entry).await;
                    }
                }
                Err(e) => {
                    error!(
                        service = %self.ctx.service(),
                        instance = %self.ctx.instance_id(),
                        correlation_id = "poll",
                        stream = %self.stream,
                        error = %e,
                        "Error in dispatch loop, backing off"
                    );
                    tokio::time::sleep(self.poll_backoff).await;
                }
            }
        }

        info!(
            service = %self.ctx.service(),
            instance = %self.ctx.instance_id(),
            consumer = %self.consumer_name,
            "Dispatcher stopped"
        );
    }

    /// Apply one entry and acknowledge it.
    ///
    /// Each entry is handled individually: a failure here never blocks the
    /// siblings fetched in the same poll. An entry that fails to apply is
    /// left pending for a later recovery or claim; an entry that cannot be
    /// decoded is acknowledged anyway, since it can never apply and would
    /// otherwise wedge the pending set forever.
    async fn handle_entry(&self, entry: &StreamEntry) {
        let event = match Event::from_fields(&entry.fields) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    service = %self.ctx.service(),
                    instance = %self.ctx.instance_id(),
                    correlation_id = %entry.id,
                    request_id = %entry.id,
                    entry_id = %entry.id,
                    stream = %self.stream,
                    error = %e,
                    "Malformed entry, acknowledging without applying"
                );
                self.ack_entry(&TraceContext::consume(&entry.id, &entry.id), &entry.id)
                    .await;
                return;
            }
        };

        let correlation_id = resolve_correlation_id(&entry.fields, &event, &entry.id);
        let trace = TraceContext::consume(&correlation_id, &entry.id);

        debug!(
            service = %self.ctx.service(),
            instance = %self.ctx.instance_id(),
            correlation_id = %trace.correlation_id,
            request_id = %trace.request_id,
            event = %event.event_type,
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer_name,
            "Entry received"
        );

        match self.applier.apply(&entry.id, &correlation_id, &event).await {
            Ok(ApplyOutcome::Applied) => {
                info!(
                    service = %self.ctx.service(),
                    instance = %self.ctx.instance_id(),
                    correlation_id = %trace.correlation_id,
                    request_id = %trace.request_id,
                    event = %event.event_type,
                    "Entry applied"
                );
                self.ack_entry(&trace, &entry.id).await;
            }
            Ok(ApplyOutcome::Duplicate) => {
                // Duplicates still get acknowledged: they must drain from
                // the pending set, not sit there forever.
                warn!(
                    service = %self.ctx.service(),
                    instance = %self.ctx.instance_id(),
                    correlation_id = %trace.correlation_id,
                    request_id = %trace.request_id,
                    event = %event.event_type,
                    "Duplicate entry skipped"
                );
                self.ack_entry(&trace, &entry.id).await;
            }
            Err(e) => {
                error!(
                    service = %self.ctx.service(),
                    instance = %self.ctx.instance_id(),
                    correlation_id = %trace.correlation_id,
                    request_id = %trace.request_id,
                    event = %event.event_type,
                    error = %e,
                    "Failed to apply entry, leaving it pending"
                );
            }
        }
    }

    /// Acknowledge one entry. Failure is logged; the entry stays pending
    /// and a future recovery pass or claimant picks it up.
    async fn ack_entry(&self, trace: &TraceContext, entry_id: &str) {
        let ids = [entry_id.to_string()];
        match self.log.ack(&self.stream, &self.group, &ids).await {
            Ok(_) => {
                debug!(
                    service = %self.ctx.service(),
                    instance = %self.ctx.instance_id(),
                    correlation_id = %trace.correlation_id,
                    request_id = %trace.request_id,
                    entry_id = %entry_id,
                    stream = %self.stream,
                    group = %self.group,
                    "Entry acknowledged"
                );
            }
            Err(e) => {
                error!(
                    service = %self.ctx.service(),
                    instance = %self.ctx.instance_id(),
                    correlation_id = %trace.correlation_id,
                    request_id = %trace.request_id,
                    entry_id = %entry_id,
                    stream = %self.stream,
                    group = %self.group,
                    error = %e,
                    "Failed to acknowledge entry, it stays pending"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::dedup::MemoryDedupStore;
    use crate::stream::MemoryDurableLog;

    fn test_config() -> StreamConfig {
        StreamConfig {
            poll_count: 10,
            poll_block_ms: 10,
            poll_backoff_ms: 5,
            claim_min_idle_ms: 20,
            ..Default::default()
        }
    }

    fn consumer(
        log: Arc<MemoryDurableLog>,
        store: Arc<MemoryDedupStore>,
        instance: &str,
    ) -> Consumer {
        let ctx = Arc::new(ProcessContext::new("service-b", Some(instance.to_string())));
        Consumer::new(log, store, ctx, &test_config())
    }

    #[tokio::test]
    async fn test_ensure_group_is_idempotent() {
        let log = Arc::new(MemoryDurableLog::new());
        let store = Arc::new(MemoryDedupStore::new());
        let consumer = consumer(log, store, "service-b-0");

        consumer.ensure_group().await.unwrap();
        consumer.ensure_group().await.unwrap();
    }

    #[tokio::test]
    async fn test_consumer_name_derives_from_instance() {
        let log = Arc::new(MemoryDurableLog::new());
        let store = Arc::new(MemoryDedupStore::new());
        let consumer = consumer(log, store, "service-b-3");

        assert_eq!(consumer.consumer_name(), "service-b-3-consumer");
    }

    #[tokio::test]
    async fn test_recover_on_empty_group_is_noop() {
        let log = Arc::new(MemoryDurableLog::new());
        let store = Arc::new(MemoryDedupStore::new());
        let consumer = consumer(log, store, "service-b-0");

        consumer.ensure_group().await.unwrap();
        consumer.recover().await;
    }
}
