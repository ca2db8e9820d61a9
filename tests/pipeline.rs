//! End-to-end pipeline tests over the in-memory backends.
//!
//! These exercise the delivery guarantees: exactly one projection per
//! correlation id under re-delivery, crash recovery, idle-claim takeover,
//! racing claimants, and full drain under sustained load.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use eventline::config::StreamConfig;
use eventline::consumer::Consumer;
use eventline::context::ProcessContext;
use eventline::dedup::{
    ApplyOutcome, DedupStore, IdempotentApplier, LogQuery, MemoryDedupStore,
};
use eventline::event::{Event, EventData, FIELD_EVENT};
use eventline::metrics::NoopMetricSink;
use eventline::publisher::EventPublisher;
use eventline::stream::{DurableLog, MemoryDurableLog};

fn stream_config() -> StreamConfig {
    StreamConfig {
        stream: "events-stream".to_string(),
        group: "service-b-consumers".to_string(),
        poll_count: 10,
        poll_block_ms: 10,
        poll_backoff_ms: 5,
        claim_min_idle_ms: 40,
        ..Default::default()
    }
}

fn context(instance: &str) -> Arc<ProcessContext> {
    Arc::new(ProcessContext::new("service-b", Some(instance.to_string())))
}

fn producer(log: &Arc<MemoryDurableLog>) -> EventPublisher {
    let ctx = Arc::new(ProcessContext::new(
        "service-a",
        Some("service-a-0".to_string()),
    ));
    EventPublisher::new(log.clone(), Arc::new(NoopMetricSink), ctx, "events-stream")
}

fn consumer(
    log: &Arc<MemoryDurableLog>,
    store: &Arc<MemoryDedupStore>,
    instance: &str,
) -> Consumer {
    Consumer::new(log.clone(), store.clone(), context(instance), &stream_config())
}

fn sample_data(duration: i64) -> EventData {
    EventData::Custom(json!({ "duration": duration }))
}

/// Wait until the store holds `expected_total` entries and the group's
/// pending set is empty, or give up after 10 seconds.
async fn wait_for_drained(
    log: &MemoryDurableLog,
    store: &MemoryDedupStore,
    config: &StreamConfig,
    expected_total: u64,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let total = store.query(&LogQuery::default()).await.unwrap().total;
        let pending = log.pending_count(&config.stream, &config.group).await;
        if total == expected_total && pending == 0 {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Steady-State Delivery
// ============================================================================

#[tokio::test]
async fn test_publish_then_consume_exactly_once() {
    let log = Arc::new(MemoryDurableLog::new());
    let store = Arc::new(MemoryDedupStore::new());
    let config = stream_config();

    let producer = producer(&log);
    for i in 0..3 {
        producer
            .publish(
                "DATA_FETCHED",
                sample_data(100 + i),
                Some(format!("c{}", i)),
            )
            .await
            .unwrap();
    }

    let consumer = consumer(&log, &store, "service-b-0");
    let stop = consumer.stop_handle();
    let dispatcher = tokio::spawn(consumer.run());

    assert!(wait_for_drained(&log, &store, &config, 3).await);

    stop.stop();
    dispatcher.await.unwrap().unwrap();

    for i in 0..3 {
        assert_eq!(store.entries_for(&format!("c{}", i)).await.len(), 1);
    }
}

#[tokio::test]
async fn test_fresh_group_delivers_preexisting_history() {
    let log = Arc::new(MemoryDurableLog::new());
    let store = Arc::new(MemoryDedupStore::new());
    let config = stream_config();

    // All published before the group exists.
    let producer = producer(&log);
    for i in 0..5 {
        producer
            .publish("RECORD_RETRIEVED", sample_data(1), Some(format!("c{}", i)))
            .await
            .unwrap();
    }

    let consumer = consumer(&log, &store, "service-b-0");
    let stop = consumer.stop_handle();
    let dispatcher = tokio::spawn(consumer.run());

    assert!(wait_for_drained(&log, &store, &config, 5).await);

    stop.stop();
    dispatcher.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_republished_correlation_projects_once() {
    // The same business action published twice (same correlation id, two
    // stream entries): one apply wins, the other drains as a duplicate.
    let log = Arc::new(MemoryDurableLog::new());
    let store = Arc::new(MemoryDedupStore::new());
    let config = stream_config();

    let producer = producer(&log);
    producer
        .publish("FILE_UPLOADED", sample_data(10), Some("c1".to_string()))
        .await
        .unwrap();
    producer
        .publish("FILE_UPLOADED", sample_data(10), Some("c1".to_string()))
        .await
        .unwrap();

    let consumer = consumer(&log, &store, "service-b-0");
    let stop = consumer.stop_handle();
    let dispatcher = tokio::spawn(consumer.run());

    assert!(wait_for_drained(&log, &store, &config, 1).await);

    stop.stop();
    dispatcher.await.unwrap().unwrap();

    assert_eq!(store.entries_for("c1").await.len(), 1);
}

#[tokio::test]
async fn test_thousand_entries_drain_with_small_polls() {
    let log = Arc::new(MemoryDurableLog::new());
    let store = Arc::new(MemoryDedupStore::new());
    let config = stream_config();

    let producer = producer(&log);
    for i in 0..1000 {
        producer
            .publish("DATA_FETCHED", sample_data(i), Some(format!("c{}", i)))
            .await
            .unwrap();
    }

    let consumer = consumer(&log, &store, "service-b-0");
    let stop = consumer.stop_handle();
    let dispatcher = tokio::spawn(consumer.run());

    assert!(wait_for_drained(&log, &store, &config, 1000).await);

    stop.stop();
    dispatcher.await.unwrap().unwrap();
}

// ============================================================================
// Crash Recovery
// ============================================================================

#[tokio::test]
async fn test_crash_after_apply_before_ack_recovers_idempotently() {
    let log = Arc::new(MemoryDurableLog::new());
    let store = Arc::new(MemoryDedupStore::new());
    let config = stream_config();

    producer(&log)
        .publish("FILE_UPLOADED", sample_data(10), Some("c1".to_string()))
        .await
        .unwrap();

    // Previous run of service-b-0: delivered, applied, died before ack.
    log.ensure_group(&config.stream, &config.group, "0")
        .await
        .unwrap();
    let delivered = log
        .read_new(
            &config.stream,
            &config.group,
            "service-b-0-consumer",
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    let applier = IdempotentApplier::new(store.clone(), context("service-b-0"));
    let event = Event::from_fields(&delivered[0].fields).unwrap();
    let outcome = applier
        .apply(&delivered[0].id, "c1", &event)
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Applied);
    assert_eq!(log.pending_count(&config.stream, &config.group).await, 1);

    // Restart with the same stable identity.
    let restarted = consumer(&log, &store, "service-b-0");
    restarted.ensure_group().await.unwrap();
    restarted.recover().await;

    assert_eq!(log.pending_count(&config.stream, &config.group).await, 0);
    assert_eq!(store.entries_for("c1").await.len(), 1);
}

#[tokio::test]
async fn test_dead_consumer_entries_are_claimed_and_applied_once() {
    let log = Arc::new(MemoryDurableLog::new());
    let store = Arc::new(MemoryDedupStore::new());
    let config = stream_config();

    producer(&log)
        .publish("DATA_FETCHED", sample_data(5), Some("c1".to_string()))
        .await
        .unwrap();

    // service-b-0 takes delivery and never returns.
    log.ensure_group(&config.stream, &config.group, "0")
        .await
        .unwrap();
    let delivered = log
        .read_new(
            &config.stream,
            &config.group,
            "service-b-0-consumer",
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    // Past the liveness threshold, a surviving replica recovers.
    tokio::time::sleep(Duration::from_millis(60)).await;

    let survivor = consumer(&log, &store, "service-b-1");
    survivor.ensure_group().await.unwrap();
    survivor.recover().await;

    assert_eq!(log.pending_count(&config.stream, &config.group).await, 0);
    let entries = store.entries_for("c1").await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].processed_by, "service-b-1");
}

#[tokio::test]
async fn test_fresh_entries_of_live_sibling_are_left_alone() {
    let log = Arc::new(MemoryDurableLog::new());
    let store = Arc::new(MemoryDedupStore::new());
    let config = stream_config();

    producer(&log)
        .publish("DATA_FETCHED", sample_data(5), Some("c1".to_string()))
        .await
        .unwrap();

    log.ensure_group(&config.stream, &config.group, "0")
        .await
        .unwrap();
    log.read_new(
        &config.stream,
        &config.group,
        "service-b-0-consumer",
        10,
        Duration::ZERO,
    )
    .await
    .unwrap();

    // No sleep: the sibling is still inside the liveness threshold. A wide
    // threshold keeps this robust against scheduler stalls.
    let mut wide_threshold = stream_config();
    wide_threshold.claim_min_idle_ms = 60_000;
    let survivor = Consumer::new(
        log.clone(),
        store.clone(),
        context("service-b-1"),
        &wide_threshold,
    );
    survivor.ensure_group().await.unwrap();
    survivor.recover().await;

    // Entry still pending under its original owner, nothing applied.
    assert_eq!(log.pending_count(&config.stream, &config.group).await, 1);
    assert_eq!(store.query(&LogQuery::default()).await.unwrap().total, 0);
}

// ============================================================================
// Claim Races
// ============================================================================

#[tokio::test]
async fn test_racing_claimants_produce_single_projection() {
    let log = Arc::new(MemoryDurableLog::new());
    let store = Arc::new(MemoryDedupStore::new());
    let config = stream_config();

    producer(&log)
        .publish("FILE_UPLOADED", sample_data(10), Some("c1".to_string()))
        .await
        .unwrap();

    // Replica 0 takes delivery, stalls after reading but before applying.
    log.ensure_group(&config.stream, &config.group, "0")
        .await
        .unwrap();
    let delivered = log
        .read_new(
            &config.stream,
            &config.group,
            "service-b-0-consumer",
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    let entry = &delivered[0];
    let event = Event::from_fields(&entry.fields).unwrap();

    // Replica 1 deems it orphaned, claims and applies it.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let survivor = consumer(&log, &store, "service-b-1");
    survivor.ensure_group().await.unwrap();
    survivor.recover().await;
    assert_eq!(store.entries_for("c1").await.len(), 1);

    // Replica 0 wakes up and finishes its in-flight apply: it must lose.
    let stalled_applier = IdempotentApplier::new(store.clone(), context("service-b-0"));
    let outcome = stalled_applier.apply(&entry.id, "c1", &event).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Duplicate);

    // Both sides acknowledge; the second ack is a harmless no-op.
    let ids = [entry.id.clone()];
    log.ack(&config.stream, &config.group, &ids).await.unwrap();

    assert_eq!(log.pending_count(&config.stream, &config.group).await, 0);
    assert_eq!(store.entries_for("c1").await.len(), 1);
}

// ============================================================================
// Failure Modes
// ============================================================================

#[tokio::test]
async fn test_malformed_entries_are_acked_never_applied() {
    let log = Arc::new(MemoryDurableLog::new());
    let store = Arc::new(MemoryDedupStore::new());
    let config = stream_config();

    let mut garbage = BTreeMap::new();
    garbage.insert(FIELD_EVENT.to_string(), "{not json".to_string());
    log.append(&config.stream, &garbage).await.unwrap();

    let mut empty = BTreeMap::new();
    empty.insert("unrelated".to_string(), "field".to_string());
    log.append(&config.stream, &empty).await.unwrap();

    let consumer = consumer(&log, &store, "service-b-0");
    let stop = consumer.stop_handle();
    let dispatcher = tokio::spawn(consumer.run());

    // Both entries delivered and drained from pending without ever landing
    // in the store.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let delivered = log.delivered_count(&config.stream, &config.group).await;
        let pending = log.pending_count(&config.stream, &config.group).await;
        if delivered == 2 && pending == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "malformed entries were not drained"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    stop.stop();
    dispatcher.await.unwrap().unwrap();

    assert_eq!(store.query(&LogQuery::default()).await.unwrap().total, 0);
}

#[tokio::test]
async fn test_dispatcher_survives_transient_poll_failures() {
    let log = Arc::new(MemoryDurableLog::new());
    let store = Arc::new(MemoryDedupStore::new());
    let config = stream_config();

    producer(&log)
        .publish("RECORD_RETRIEVED", sample_data(1), Some("c1".to_string()))
        .await
        .unwrap();

    log.fail_next_reads(3).await;

    let consumer = consumer(&log, &store, "service-b-0");
    let stop = consumer.stop_handle();
    let dispatcher = tokio::spawn(consumer.run());

    assert!(wait_for_drained(&log, &store, &config, 1).await);

    stop.stop();
    dispatcher.await.unwrap().unwrap();
}
