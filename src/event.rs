//! Domain events carried through the durable log.
//!
//! An event rides in a stream entry's string-field map: the full JSON
//! payload under `event`, plus a handful of flattened fields so that log
//! tooling can filter without parsing JSON. The payload body is a tagged
//! union over the event types the producer emits today, with a generic
//! fallback for types this consumer does not yet understand.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field holding the full JSON-encoded event payload.
pub const FIELD_EVENT: &str = "event";
/// Flattened event type, mirrors the payload's `event` field.
pub const FIELD_ACTION: &str = "action";
/// Flattened origin service name.
pub const FIELD_SERVICE: &str = "service";
/// Flattened correlation id.
pub const FIELD_CORRELATION_ID: &str = "correlationId";
/// Flattened origin instance id.
pub const FIELD_INSTANCE_ID: &str = "instanceId";
/// Flattened publish timestamp (ms since epoch, decimal string).
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Result type for event encode/decode.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors that can occur while encoding or decoding events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Entry has no '{FIELD_EVENT}' field")]
    MissingPayload,
}

/// A domain event as published to and consumed from the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type, e.g. `FILE_UPLOADED`.
    #[serde(rename = "event")]
    pub event_type: String,
    /// Structured payload for this event type.
    pub data: EventData,
    /// Publish time, ms since epoch.
    pub timestamp: i64,
    /// Service that published the event.
    pub service: String,
    /// Business-action-scoped id, the idempotency key.
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    /// Instance id of the publishing process.
    #[serde(
        rename = "instanceId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub instance_id: Option<String>,
}

/// Event payload bodies.
///
/// Untagged: the variant is recognized by its field set, and anything that
/// matches no known shape lands in `Custom` so newer producers do not break
/// older consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    RecordsSearched {
        query: String,
        page: u64,
        limit: u64,
        #[serde(rename = "resultCount")]
        result_count: u64,
        total: u64,
        duration: i64,
    },
    FileUploaded {
        filename: String,
        filepath: String,
        #[serde(rename = "recordCount")]
        record_count: u64,
        #[serde(rename = "insertedCount")]
        inserted_count: u64,
        duration: i64,
    },
    DataFetched {
        url: String,
        format: String,
        filepath: String,
        #[serde(rename = "recordCount")]
        record_count: u64,
        duration: i64,
    },
    RecordRetrieved {
        #[serde(rename = "recordId")]
        record_id: String,
    },
    /// Forward-compatible fallback for unknown event types.
    Custom(Value),
}

impl EventData {
    /// Duration carried by the payload, if any. Used as the metric value
    /// and the time-series value on the query side (absent means 1).
    pub fn duration_ms(&self) -> Option<i64> {
        match self {
            EventData::RecordsSearched { duration, .. }
            | EventData::FileUploaded { duration, .. }
            | EventData::DataFetched { duration, .. } => Some(*duration),
            EventData::RecordRetrieved { .. } => None,
            EventData::Custom(value) => value.get("duration").and_then(Value::as_i64),
        }
    }
}

impl Event {
    /// Encode into the stream entry field map.
    pub fn to_fields(&self) -> Result<BTreeMap<String, String>> {
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_EVENT.to_string(), serde_json::to_string(self)?);
        fields.insert(FIELD_ACTION.to_string(), self.event_type.clone());
        fields.insert(FIELD_SERVICE.to_string(), self.service.clone());
        if let Some(ref correlation_id) = self.correlation_id {
            fields.insert(FIELD_CORRELATION_ID.to_string(), correlation_id.clone());
        }
        if let Some(ref instance_id) = self.instance_id {
            fields.insert(FIELD_INSTANCE_ID.to_string(), instance_id.clone());
        }
        fields.insert(FIELD_TIMESTAMP.to_string(), self.timestamp.to_string());
        Ok(fields)
    }

    /// Decode from a stream entry field map.
    ///
    /// The `event` field is authoritative; the flattened fields are for
    /// filtering only and are not re-validated here.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        let payload = fields.get(FIELD_EVENT).ok_or(EventError::MissingPayload)?;
        Ok(serde_json::from_str(payload)?)
    }
}

/// Resolve the idempotency key for an entry.
///
/// The flattened field wins, then the payload's own correlation id, then
/// the log-assigned entry id. The entry-id fallback survives re-delivery
/// but not a producer re-publish, which mints a fresh entry id.
pub fn resolve_correlation_id(
    fields: &BTreeMap<String, String>,
    event: &Event,
    entry_id: &str,
) -> String {
    fields
        .get(FIELD_CORRELATION_ID)
        .cloned()
        .or_else(|| event.correlation_id.clone())
        .unwrap_or_else(|| entry_id.to_string())
}
