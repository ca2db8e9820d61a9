//! Publishes a single event from the command line.
//!
//! Usage: eventline-producer <event-type> [json-payload] [correlation-id]
//!
//! The payload defaults to an empty object; known event shapes parse into
//! their typed form, anything else rides as a generic payload.

use std::sync::Arc;

use eventline::bootstrap::{connect_with_retry, init_tracing};
use eventline::config::Config;
use eventline::context::ProcessContext;
use eventline::event::EventData;
use eventline::publisher::EventPublisher;
use eventline::{metrics, stream};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let Some(event_type) = args.next() else {
        eprintln!("Usage: eventline-producer <event-type> [json-payload] [correlation-id]");
        std::process::exit(2);
    };
    let payload = args.next().unwrap_or_else(|| "{}".to_string());
    let correlation_id = args.next();

    let data: EventData = serde_json::from_str(&payload)?;

    let config = Config::load(None)?;
    let ctx = Arc::new(ProcessContext::new(
        &config.service.name,
        config.service.instance_id.clone(),
    ));

    let log = connect_with_retry("durable log", &config.stream.url, || {
        stream::init_stream(&config.stream)
    })
    .await?;

    let sink = metrics::init_metrics(&config.metrics, &config.stream.url).await?;

    let publisher = EventPublisher::new(log, sink, ctx, &config.stream.stream)
        .with_metric_retention_ms(config.metrics.retention_ms);

    let entry_id = publisher.publish(&event_type, data, correlation_id).await?;
    println!("{}", entry_id);

    Ok(())
}
