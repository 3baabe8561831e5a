use crate::models::domain::Severity;

pub const DEFAULT_HIGH_THRESHOLD_KBPS: f64 = 5000.0;

/// Maps a flow's throughput to a severity level.
pub trait SeverityClassifier: Send + Sync {
    fn classify(&self, speed_kbps: f64) -> Severity;
}

/// Two-level classifier: strictly above the threshold is `High`.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdClassifier {
    high_above_kbps: f64,
}

impl ThresholdClassifier {
    pub fn new(high_above_kbps: f64) -> Self {
        Self { high_above_kbps }
    }

    pub fn threshold(&self) -> f64 {
        self.high_above_kbps
    }
}

impl Default for ThresholdClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_THRESHOLD_KBPS)
    }
}

impl SeverityClassifier for ThresholdClassifier {
    fn classify(&self, speed_kbps: f64) -> Severity {
        if speed_kbps > self.high_above_kbps {
            Severity::High
        } else {
            Severity::Medium
        }
    }
}

impl<F> SeverityClassifier for F
where
    F: Fn(f64) -> Severity + Send + Sync,
{
    fn classify(&self, speed_kbps: f64) -> Severity {
        self(speed_kbps)
    }
}
