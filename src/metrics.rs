//! Best-effort metric sink.
//!
//! Publishing a data point must never block or fail business flow: every
//! caller logs and swallows sink errors. The Redis implementation talks to
//! the RedisTimeSeries module with raw commands; `NoopMetricSink` stands in
//! when metrics are disabled or the backend is not compiled in.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::MetricsConfig;

/// Result type for metric-sink operations.
pub type Result<T> = std::result::Result<T, MetricError>;

/// Errors that can occur during metric-sink operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[cfg(feature = "redis")]
    #[error("Sink I/O error: {0}")]
    Io(#[from] ::redis::RedisError),

    #[error("Time-series module not loaded on the metric sink")]
    ModuleMissing,

    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Interface to a time-series metric sink.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Create the series if needed. Already-exists surfaces as an error the
    /// caller is expected to tolerate.
    async fn ensure_series(
        &self,
        key: &str,
        retention_ms: u64,
        labels: &[(&str, &str)],
    ) -> Result<()>;

    /// Add one data point to the series.
    async fn add_point(&self, key: &str, timestamp_ms: i64, value: i64) -> Result<()>;
}

/// No-op sink used when metrics are disabled.
pub struct NoopMetricSink;

#[async_trait]
impl MetricSink for NoopMetricSink {
    async fn ensure_series(
        &self,
        _key: &str,
        _retention_ms: u64,
        _labels: &[(&str, &str)],
    ) -> Result<()> {
        Ok(())
    }

    async fn add_point(&self, key: &str, _timestamp_ms: i64, _value: i64) -> Result<()> {
        debug!(key = %key, "Metrics disabled, dropping data point");
        Ok(())
    }
}

/// RedisTimeSeries sink (TS.CREATE / TS.ADD).
#[cfg(feature = "redis")]
pub struct RedisTimeSeriesSink {
    conn: ::redis::aio::ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisTimeSeriesSink {
    /// Connect to a Redis server with the RedisTimeSeries module.
    pub async fn new(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ::redis::aio::ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis time series");

        Ok(Self { conn })
    }

    /// Distinguish "module not loaded" from ordinary I/O failures so the
    /// operator sees an actionable message instead of a command error.
    fn map_error(error: ::redis::RedisError) -> MetricError {
        if error.to_string().contains("unknown command") {
            MetricError::ModuleMissing
        } else {
            MetricError::Io(error)
        }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl MetricSink for RedisTimeSeriesSink {
    async fn ensure_series(
        &self,
        key: &str,
        retention_ms: u64,
        labels: &[(&str, &str)],
    ) -> Result<()> {
        let mut conn = self.conn.clone();

        let mut cmd = ::redis::cmd("TS.CREATE");
        cmd.arg(key).arg("RETENTION").arg(retention_ms);
        if !labels.is_empty() {
            cmd.arg("LABELS");
            for (name, value) in labels {
                cmd.arg(name).arg(value);
            }
        }

        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(Self::map_error)?;

        debug!(key = %key, retention_ms = retention_ms, "Created time series");

        Ok(())
    }

    async fn add_point(&self, key: &str, timestamp_ms: i64, value: i64) -> Result<()> {
        let mut conn = self.conn.clone();

        let _: i64 = ::redis::cmd("TS.ADD")
            .arg(key)
            .arg(timestamp_ms)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_error)?;

        Ok(())
    }
}

/// Initialize the metric sink from configuration.
///
/// Falls back to the no-op sink when metrics are disabled; a sink that
/// cannot be reached at startup is a hard error so misconfiguration is not
/// silently degraded to no metrics.
#[cfg(feature = "redis")]
pub async fn init_metrics(
    config: &MetricsConfig,
    fallback_url: &str,
) -> Result<Arc<dyn MetricSink>> {
    if !config.enabled {
        info!("Metrics disabled, using noop sink");
        return Ok(Arc::new(NoopMetricSink));
    }

    let url = config.url.as_deref().unwrap_or(fallback_url);
    let sink = RedisTimeSeriesSink::new(url).await?;
    Ok(Arc::new(sink))
}

#[cfg(not(feature = "redis"))]
pub async fn init_metrics(
    _config: &MetricsConfig,
    _fallback_url: &str,
) -> Result<Arc<dyn MetricSink>> {
    info!("Redis feature disabled, using noop metric sink");
    Ok(Arc::new(NoopMetricSink))
}
