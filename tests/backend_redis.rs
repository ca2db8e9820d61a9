//! Redis durable-log integration tests.
//!
//! Run with: cargo test --test backend_redis -- --ignored --nocapture
//!
//! Requires: REDIS_URI env var or Redis on localhost:6379
//!
//! Note: Tests use unique stream names to avoid data conflicts between runs.

use std::collections::BTreeMap;
use std::time::Duration;

use eventline::stream::{DurableLog, RedisDurableLog};

fn redis_uri() -> String {
    std::env::var("REDIS_URI").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_stream() -> String {
    format!(
        "test-stream-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

fn fields(value: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert("payload".to_string(), value.to_string());
    map
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_stream_delivery_claim_ack() {
    let log = RedisDurableLog::new(&redis_uri())
        .await
        .expect("Failed to connect to Redis");
    let stream = test_stream();

    for i in 0..3 {
        let id = log.append(&stream, &fields(&i.to_string())).await.unwrap();
        assert!(id.contains('-'));
    }

    log.ensure_group(&stream, "g", "0").await.unwrap();
    // Creating the group again is not an error.
    log.ensure_group(&stream, "g", "0").await.unwrap();

    let batch = log
        .read_new(&stream, "g", "c1", 2, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].fields.get("payload").unwrap(), "0");

    let pending = log.list_pending(&stream, "g").await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|p| p.consumer == "c1"));

    // Ack one, the other stays pending.
    let acked = log
        .ack(&stream, "g", &[batch[0].id.clone()])
        .await
        .unwrap();
    assert_eq!(acked, 1);
    assert_eq!(log.list_pending(&stream, "g").await.unwrap().len(), 1);

    // Another consumer claims the remainder.
    let claimed = log
        .claim(
            &stream,
            "g",
            "c2",
            Duration::ZERO,
            &[batch[1].id.clone()],
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let pending = log.list_pending(&stream, "g").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consumer, "c2");
    assert!(pending[0].delivery_count >= 2);

    // c2 re-reads its own pending entries.
    let own = log.read_pending(&stream, "g", "c2", 10).await.unwrap();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].id, batch[1].id);

    log.ack(&stream, "g", &[batch[1].id.clone()]).await.unwrap();

    // The third entry is still undelivered.
    let rest = log
        .read_new(&stream, "g", "c1", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].fields.get("payload").unwrap(), "2");
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_claim_respects_min_idle() {
    let log = RedisDurableLog::new(&redis_uri())
        .await
        .expect("Failed to connect to Redis");
    let stream = test_stream();

    log.append(&stream, &fields("a")).await.unwrap();
    log.ensure_group(&stream, "g", "0").await.unwrap();
    let batch = log
        .read_new(&stream, "g", "c1", 10, Duration::from_millis(100))
        .await
        .unwrap();

    let claimed = log
        .claim(
            &stream,
            "g",
            "c2",
            Duration::from_secs(3600),
            &[batch[0].id.clone()],
        )
        .await
        .unwrap();
    assert!(claimed.is_empty());
}
