pub mod domain {
    use chrono::{DateTime, Local};
    use serde::Serialize;
    use std::fmt;

    /// Directed flow identity: traffic from `source` to `destination`.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct FlowKey {
        pub source: String,
        pub destination: String,
    }

    impl FlowKey {
        pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
            FlowKey {
                source: source.into(),
                destination: destination.into(),
            }
        }
    }

    impl fmt::Display for FlowKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} -> {}", self.source, self.destination)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub enum Severity {
        Medium,
        High,
    }

    impl fmt::Display for Severity {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Severity::Medium => f.write_str("Medium"),
                Severity::High => f.write_str("High"),
            }
        }
    }

    /// Throughput of one flow over one window.
    #[derive(Debug, Clone, PartialEq)]
    pub struct FlowSnapshot {
        pub source: String,
        pub destination: String,
        pub speed_kbps: f64,
        pub severity: Severity,
        pub captured_at: DateTime<Local>,
    }
}

pub mod dto {
    use super::domain::{FlowSnapshot, Severity};
    use chrono::{DateTime, Local};
    use serde::Serialize;

    /// Wire shape of a snapshot record. Field names are part of the
    /// client contract.
    #[derive(Debug, Serialize, Clone)]
    pub struct FlowSnapshotDto<'a> {
        #[serde(rename = "SourceIP")]
        pub source_ip: &'a str,
        #[serde(rename = "DestinationIP")]
        pub destination_ip: &'a str,
        #[serde(rename = "SpeedKbps")]
        pub speed_kbps: f64,
        #[serde(rename = "Severity")]
        pub severity: Severity,
        #[serde(rename = "Time")]
        pub time: DateTime<Local>,
    }

    impl<'a> From<&'a FlowSnapshot> for FlowSnapshotDto<'a> {
        fn from(snapshot: &'a FlowSnapshot) -> Self {
            FlowSnapshotDto {
                source_ip: &snapshot.source,
                destination_ip: &snapshot.destination,
                speed_kbps: snapshot.speed_kbps,
                severity: snapshot.severity,
                time: snapshot.captured_at,
            }
        }
    }

    /// Serializes a whole tick as one JSON array.
    pub fn encode_snapshots(snapshots: &[FlowSnapshot]) -> serde_json::Result<String> {
        let records: Vec<FlowSnapshotDto<'_>> = snapshots.iter().map(FlowSnapshotDto::from).collect();
        serde_json::to_string(&records)
    }
}
