//! Fixed-cadence drain of the aggregator into throughput snapshots.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::broadcast::BroadcastServer;
use crate::detection::SeverityClassifier;
use crate::flow::FlowAggregator;
use crate::models::domain::{FlowKey, FlowSnapshot};
use crate::sniff::IngestStats;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Rounds to one decimal place.
fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// `(bytes / 1024) / elapsed`, rounded to one decimal.
pub fn speed_kbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    round1((bytes as f64 / 1024.0) / secs)
}

/// Turns one drained window into snapshot records. Flows with no bytes are
/// left out.
pub fn build_snapshots(
    window: HashMap<FlowKey, u64>,
    elapsed: Duration,
    classifier: &dyn SeverityClassifier,
    captured_at: DateTime<Local>,
) -> Vec<FlowSnapshot> {
    window
        .into_iter()
        .filter(|(_, bytes)| *bytes > 0)
        .map(|(key, bytes)| {
            let speed = speed_kbps(bytes, elapsed);
            FlowSnapshot {
                source: key.source,
                destination: key.destination,
                speed_kbps: speed,
                severity: classifier.classify(speed),
                captured_at,
            }
        })
        .collect()
}

pub struct SnapshotScheduler {
    aggregator: Arc<FlowAggregator>,
    server: Arc<BroadcastServer>,
    classifier: Arc<dyn SeverityClassifier>,
    interval: Duration,
    final_drain: bool,
    print_flows: bool,
    ingest_stats: Option<Arc<IngestStats>>,
}

impl SnapshotScheduler {
    pub fn new(
        aggregator: Arc<FlowAggregator>,
        server: Arc<BroadcastServer>,
        classifier: Arc<dyn SeverityClassifier>,
        interval: Duration,
    ) -> Self {
        Self {
            aggregator,
            server,
            classifier,
            interval,
            final_drain: true,
            print_flows: false,
            ingest_stats: None,
        }
    }

    /// Whether stopping performs one last drain and broadcast.
    pub fn final_drain(mut self, enabled: bool) -> Self {
        self.final_drain = enabled;
        self
    }

    /// Log the flow table every tick.
    pub fn print_flows(mut self, enabled: bool) -> Self {
        self.print_flows = enabled;
        self
    }

    pub fn ingest_stats(mut self, stats: Arc<IngestStats>) -> Self {
        self.ingest_stats = Some(stats);
        self
    }

    /// Ticks until `stop` flips to `true` or its sender is dropped. One tick
    /// is fully broadcast before the next one starts.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // The tick's return value is its deadline, not when it fired.
                    let now = Instant::now();
                    let elapsed = now.saturating_duration_since(last);
                    last = now;
                    self.tick(elapsed);
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        if self.final_drain {
            self.tick(last.elapsed());
        }
        debug!("snapshot scheduler stopped");
    }

    /// Drains one window measured as `elapsed` and broadcasts it.
    pub fn tick(&self, elapsed: Duration) -> Vec<FlowSnapshot> {
        let window = self.aggregator.drain_all();
        let mut snapshots =
            build_snapshots(window, elapsed, self.classifier.as_ref(), Local::now());

        if self.print_flows {
            snapshots.sort_by(|a, b| b.speed_kbps.total_cmp(&a.speed_kbps));
            for f in &snapshots {
                info!("{} -> {} | {} KB/s [{}]", f.source, f.destination, f.speed_kbps, f.severity);
            }
        }
        if let Some(stats) = &self.ingest_stats {
            debug!(counts = ?stats.snapshot(), "ingest counters");
        }

        match self.server.broadcast(&snapshots) {
            Ok(report) => debug!(
                flows = snapshots.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                delivered = report.delivered,
                skipped = report.skipped,
                removed = report.removed,
                "tick broadcast"
            ),
            Err(e) => error!("Skipping broadcast tick: {}", e),
        }
        snapshots
    }
}
