use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::detection::DEFAULT_HIGH_THRESHOLD_KBPS;
use crate::error::ConfigError;
use crate::sniff::CaptureSettings;

#[derive(Parser, Debug, Clone)]
#[command(name = "flowmon")]
#[command(about = "Per-flow throughput monitor streaming snapshots over websocket")]
pub struct Config {
    #[arg(long, env = "FLOWMON_LISTEN", default_value = crate::broadcast::DEFAULT_LISTEN_ADDR, help = "Websocket bind address")]
    pub listen: SocketAddr,

    #[arg(short, long, env = "FLOWMON_INTERFACE", help = "Network interface to capture on")]
    pub interface: Option<String>,

    #[arg(long, env = "FLOWMON_PCAP_FILE", conflicts_with = "interface", help = "Replay a capture file instead of a live device")]
    pub pcap_file: Option<PathBuf>,

    #[arg(long, env = "FLOWMON_FILTER", default_value = "ip or ip6", help = "BPF filter applied to the capture")]
    pub filter: String,

    #[arg(long, env = "FLOWMON_SNAPLEN", default_value_t = 65535)]
    pub snaplen: i32,

    #[arg(long, env = "FLOWMON_PROMISC", help = "Put the interface in promiscuous mode")]
    pub promisc: bool,

    #[arg(long, env = "FLOWMON_INTERVAL_MS", default_value_t = 1000, help = "Snapshot interval in milliseconds")]
    pub interval_ms: u64,

    #[arg(long, env = "FLOWMON_HIGH_THRESHOLD_KBPS", default_value_t = DEFAULT_HIGH_THRESHOLD_KBPS)]
    pub high_threshold_kbps: f64,

    #[arg(long, env = "FLOWMON_QUEUE_CAPACITY", default_value_t = 65536, help = "Frames buffered between capture and decode")]
    pub queue_capacity: usize,

    #[arg(long, env = "FLOWMON_SESSION_BUFFER", default_value_t = 1, help = "Ticks queued per client before ticks are skipped")]
    pub session_buffer: usize,

    #[arg(long, help = "Do not drain and broadcast once more on shutdown")]
    pub skip_final_drain: bool,

    #[arg(long, help = "Log the live flow table every tick")]
    pub print_flows: bool,

    #[arg(short, long, help = "Enable debug logging")]
    pub debug: bool,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Zero { field: "interval-ms" });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero { field: "queue-capacity" });
        }
        if self.session_buffer == 0 {
            return Err(ConfigError::Zero { field: "session-buffer" });
        }
        if self.snaplen <= 0 {
            return Err(ConfigError::Zero { field: "snaplen" });
        }
        if !self.high_threshold_kbps.is_finite() || self.high_threshold_kbps < 0.0 {
            return Err(ConfigError::Threshold(self.high_threshold_kbps));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            interface: self.interface.clone(),
            snaplen: self.snaplen,
            promisc: self.promisc,
            filter: Some(self.filter.clone()).filter(|f| !f.trim().is_empty()),
        }
    }
}
