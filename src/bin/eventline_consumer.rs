//! Consumer-side pipeline binary.
//!
//! Bootstraps the consumer group, recovers entries left pending by earlier
//! runs, then dispatches until SIGINT/SIGTERM. Shutdown stops new polls but
//! lets the batch in flight finish.

use std::sync::Arc;

use tracing::info;

use eventline::bootstrap::{connect_with_retry, init_tracing};
use eventline::config::Config;
use eventline::consumer::Consumer;
use eventline::context::ProcessContext;
use eventline::{dedup, stream};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(std::env::args().nth(1).as_deref())?;
    let ctx = Arc::new(ProcessContext::new(
        &config.service.name,
        config.service.instance_id.clone(),
    ));

    let log = connect_with_retry("durable log", &config.stream.url, || {
        stream::init_stream(&config.stream)
    })
    .await?;

    let store = connect_with_retry("dedup store", &config.dedup.uri, || {
        dedup::init_dedup(&config.dedup)
    })
    .await?;

    let consumer = Consumer::new(log, store, ctx, &config.stream);
    let stop = consumer.stop_handle();
    let mut dispatcher = tokio::spawn(consumer.run());

    tokio::select! {
        // Bootstrap failure or unexpected loop exit.
        result = &mut dispatcher => {
            result??;
            return Ok(());
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping dispatcher");
            stop.stop();
        }
    }

    dispatcher.await??;

    Ok(())
}

/// Resolve on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
