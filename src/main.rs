use anyhow::Context;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowmon::broadcast::{bind_listener, BroadcastServer};
use flowmon::config::Config;
use flowmon::detection::ThresholdClassifier;
use flowmon::flow::FlowAggregator;
use flowmon::scheduler::SnapshotScheduler;
use flowmon::sniff::{Ingestor, PcapSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = Config::parse();
    init_tracing(config.debug);
    config.validate().context("invalid configuration")?;

    let running = Arc::new(AtomicBool::new(true));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
            let _ = shutdown_tx.send(true);
        })
        .context("failed to install Ctrl-C handler")?;
    }

    let listener = bind_listener(config.listen)
        .await
        .context("cannot open websocket endpoint")?;
    let aggregator = Arc::new(FlowAggregator::new());
    let ingestor = start_capture(&config, aggregator.clone(), running.clone())?;

    let server = Arc::new(BroadcastServer::new(config.session_buffer));
    let (server_stop_tx, server_stop_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.clone().serve(listener, server_stop_rx));

    let scheduler = SnapshotScheduler::new(
        aggregator,
        server,
        Arc::new(ThresholdClassifier::new(config.high_threshold_kbps)),
        config.interval(),
    )
    .final_drain(!config.skip_final_drain)
    .print_flows(config.print_flows)
    .ingest_stats(ingestor.stats());
    let (scheduler_stop_tx, scheduler_stop_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(scheduler_stop_rx));

    info!(interval_ms = config.interval_ms, "monitoring flows, press Ctrl-C to stop");
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    info!("shutting down");

    // Capture stops first so the final drain sees every queued frame.
    running.store(false, Ordering::SeqCst);
    let counts = tokio::task::spawn_blocking(move || ingestor.join())
        .await
        .context("ingest threads did not shut down")?;

    let _ = scheduler_stop_tx.send(true);
    if let Err(e) = scheduler_task.await {
        warn!("Snapshot scheduler ended abnormally: {}", e);
    }
    let _ = server_stop_tx.send(true);
    if let Err(e) = server_task.await {
        warn!("Broadcast server ended abnormally: {}", e);
    }

    info!(
        received = counts.frames_received,
        dropped = counts.frames_dropped,
        undecodable = counts.frames_undecodable,
        accounted = counts.frames_accounted,
        bytes = counts.bytes_accounted,
        "capture summary"
    );
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Opens the configured capture source; without one the process cannot run.
fn start_capture(
    config: &Config,
    aggregator: Arc<FlowAggregator>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<Ingestor> {
    let capture = config.capture_settings();
    let ingestor = match &config.pcap_file {
        Some(path) => {
            let source = PcapSource::open_file(path, capture.filter.as_deref())
                .context("no capture source available")?;
            Ingestor::spawn(source, aggregator, config.queue_capacity, running)
        }
        None => {
            let source =
                PcapSource::open_device(&capture).context("no capture source available")?;
            Ingestor::spawn(source, aggregator, config.queue_capacity, running)
        }
    };
    ingestor.context("failed to start ingest threads")
}
