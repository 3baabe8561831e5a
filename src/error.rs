//! Error types for the capture, broadcast and configuration layers.
//!
//! Only startup failures surface to the process; per-packet and per-session
//! failures are handled where they occur and never reach these types.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no capture device available")]
    NoDevice,

    #[error("failed to open capture on '{target}': {source}")]
    Open {
        target: String,
        #[source]
        source: pcap::Error,
    },

    #[error("invalid capture filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    /// The source will never deliver another frame.
    #[error("capture source exhausted")]
    Exhausted,

    #[error("packet capture failed: {0}")]
    Pcap(#[from] pcap::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize snapshot set: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("high threshold must be a finite, non-negative number (got {0})")]
    Threshold(f64),
}
