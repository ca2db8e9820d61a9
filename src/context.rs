//! Process identity and tracing context.
//!
//! A single `ProcessContext` is constructed at startup and passed by `Arc`
//! into every component that publishes, consumes, or logs. The instance id
//! must be stable across restarts of the same slot so that pending entries
//! left behind by a killed process are attributable to the consumer that
//! recovers them.

use tracing::info;
use uuid::Uuid;

/// Environment variable overriding the derived instance id.
pub const INSTANCE_ID_ENV_VAR: &str = "INSTANCE_ID";
/// Environment variable carrying the pod/host name (set by orchestrators).
pub const HOSTNAME_ENV_VAR: &str = "HOSTNAME";

/// Identity of this process: service name plus stable instance id.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    service: String,
    instance_id: String,
}

impl ProcessContext {
    /// Build the context for `service`.
    ///
    /// Instance id derivation, in order:
    /// 1. Explicit override (config value or `INSTANCE_ID` env var).
    /// 2. `HOSTNAME` ending in `-<ordinal>` (StatefulSet-style replicas)
    ///    becomes `<service>-<ordinal>`.
    /// 3. Fallback: `<service>-<8 hex chars>`. This one is fresh per
    ///    process, so a previous run's pending entries are picked up by the
    ///    idle-claim path instead of the own-identity path.
    pub fn new(service: &str, instance_id: Option<String>) -> Self {
        let instance_id = instance_id
            .or_else(|| std::env::var(INSTANCE_ID_ENV_VAR).ok())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| {
                std::env::var(HOSTNAME_ENV_VAR)
                    .ok()
                    .and_then(|hostname| derive_from_hostname(service, &hostname))
                    .unwrap_or_else(|| random_instance_id(service))
            });

        info!(
            service = %service,
            instance = %instance_id,
            "Process context initialized"
        );

        Self {
            service: service.to_string(),
            instance_id,
        }
    }

    /// Service name, e.g. `service-b`.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Stable per-process instance identifier.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Consumer identity within a group, derived from the instance id.
    pub fn consumer_name(&self) -> String {
        format!("{}-consumer", self.instance_id)
    }
}

/// Derive `<service>-<ordinal>` from a hostname with a trailing ordinal.
fn derive_from_hostname(service: &str, hostname: &str) -> Option<String> {
    let (_, ordinal) = hostname.rsplit_once('-')?;
    if ordinal.is_empty() || !ordinal.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}-{}", service, ordinal))
}

fn random_instance_id(service: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", service, &suffix[..8])
}

/// Correlation pair attached to every publish and every consume hop.
///
/// `correlation_id` is business-action-scoped and stable across the
/// publish-consume hop; `request_id` is hop-local: the correlation id itself
/// at publish time, the log entry id at consume time.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub correlation_id: String,
    pub request_id: String,
}

impl TraceContext {
    /// Trace context for the publish side of a hop.
    pub fn publish(correlation_id: &str) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            request_id: correlation_id.to_string(),
        }
    }

    /// Trace context for the consume side: the entry id is the hop-local id.
    pub fn consume(correlation_id: &str, entry_id: &str) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            request_id: entry_id.to_string(),
        }
    }

    /// Trace context for internal lifecycle stages ("init", "recovery").
    pub fn stage(stage: &str) -> Self {
        Self {
            correlation_id: stage.to_string(),
            request_id: stage.to_string(),
        }
    }
}
