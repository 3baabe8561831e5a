//! Live per-flow throughput monitoring.
//!
//! Frames flow from a [`sniff::PacketSource`] through the decoder into the
//! [`flow::FlowAggregator`]; the [`scheduler::SnapshotScheduler`] drains it on
//! a fixed cadence and the [`broadcast::BroadcastServer`] pushes each tick to
//! every connected websocket client.

pub mod broadcast;
pub mod config;
pub mod detection;
pub mod error;
pub mod flow;
pub mod models;
pub mod parser;
pub mod scheduler;
pub mod sniff;
