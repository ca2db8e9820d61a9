//! Event publisher.
//!
//! Appends a domain event to the durable log, then best-effort records a
//! data point in a per-action time series. Append failures propagate to the
//! caller, which decides whether the triggering request fails; metric
//! failures never do.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::{ProcessContext, TraceContext};
use crate::event::{Event, EventData, EventError};
use crate::metrics::MetricSink;
use crate::stream::{DurableLog, StreamError};

/// Time-series key prefix; full key: `api_action:<event_type>`.
pub const METRIC_KEY_PREFIX: &str = "api_action:";

/// Default metric retention: 30 days.
pub const DEFAULT_METRIC_RETENTION_MS: u64 = 30 * 86_400_000;

/// Errors that can occur while publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to append event to stream: {0}")]
    Append(#[from] StreamError),

    #[error("Failed to encode event: {0}")]
    Encode(#[from] EventError),
}

/// Publishes domain events to one stream.
pub struct EventPublisher {
    log: Arc<dyn DurableLog>,
    metrics: Arc<dyn MetricSink>,
    ctx: Arc<ProcessContext>,
    stream: String,
    metric_retention_ms: u64,
}

impl EventPublisher {
    pub fn new(
        log: Arc<dyn DurableLog>,
        metrics: Arc<dyn MetricSink>,
        ctx: Arc<ProcessContext>,
        stream: &str,
    ) -> Self {
        Self {
            log,
            metrics,
            ctx,
            stream: stream.to_string(),
            metric_retention_ms: DEFAULT_METRIC_RETENTION_MS,
        }
    }

    /// Override the metric retention window.
    pub fn with_metric_retention_ms(mut self, retention_ms: u64) -> Self {
        self.metric_retention_ms = retention_ms;
        self
    }

    /// Publish one event; returns the log-assigned entry id.
    ///
    /// A correlation id is minted when the caller supplies none. The append
    /// is not retried here: the caller owns the decision of whether a
    /// publish failure fails the business action that triggered it.
    pub async fn publish(
        &self,
        event_type: &str,
        data: EventData,
        correlation_id: Option<String>,
    ) -> Result<String, PublishError> {
        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let trace = TraceContext::publish(&correlation_id);
        let timestamp = Utc::now().timestamp_millis();

        let event = Event {
            event_type: event_type.to_string(),
            data,
            timestamp,
            service: self.ctx.service().to_string(),
            correlation_id: Some(correlation_id.clone()),
            instance_id: Some(self.ctx.instance_id().to_string()),
        };

        let fields = event.to_fields()?;

        let entry_id = match self.log.append(&self.stream, &fields).await {
            Ok(id) => id,
            Err(e) => {
                error!(
                    service = %self.ctx.service(),
                    instance = %self.ctx.instance_id(),
                    correlation_id = %trace.correlation_id,
                    request_id = %trace.request_id,
                    action = %event_type,
                    error = %e,
                    "Failed to publish event to stream"
                );
                return Err(e.into());
            }
        };

        info!(
            service = %self.ctx.service(),
            instance = %self.ctx.instance_id(),
            correlation_id = %trace.correlation_id,
            request_id = %trace.request_id,
            action = %event_type,
            entry_id = %entry_id,
            stream = %self.stream,
            "Published event to stream"
        );

        self.record_metric(&trace, event_type, &event).await;

        Ok(entry_id)
    }

    /// Best-effort metric emission: failures are logged and swallowed.
    async fn record_metric(&self, trace: &TraceContext, action: &str, event: &Event) {
        let key = format!("{}{}", METRIC_KEY_PREFIX, action);
        let labels = [("service", self.ctx.service()), ("action", action)];

        if let Err(e) = self
            .metrics
            .ensure_series(&key, self.metric_retention_ms, &labels)
            .await
        {
            warn!(
                service = %self.ctx.service(),
                instance = %self.ctx.instance_id(),
                correlation_id = %trace.correlation_id,
                key = %key,
                error = %e,
                "Failed to create time series (may already exist)"
            );
        }

        let value = event.data.duration_ms().unwrap_or(1);
        match self.metrics.add_point(&key, event.timestamp, value).await {
            Ok(()) => {
                debug!(
                    correlation_id = %trace.correlation_id,
                    key = %key,
                    value = value,
                    "Added data point to time series"
                );
            }
            Err(e) => {
                error!(
                    service = %self.ctx.service(),
                    instance = %self.ctx.instance_id(),
                    correlation_id = %trace.correlation_id,
                    key = %key,
                    value = value,
                    error = %e,
                    "Failed to add data point to time series"
                );
            }
        }
    }
}
