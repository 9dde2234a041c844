//! Data-channel write statistics.

use serde::Serialize;

/// Counters over data-channel write attempts.
///
/// Diagnostic only: the pacing engine never looks at these to make decisions.
/// Reset when a transmission starts, monotonically non-decreasing otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStatistics {
    /// Every write attempt, successful or not.
    pub total_writes: u64,
    /// Attempts that returned a non-zero status.
    pub failed_writes: u64,
}

impl WriteStatistics {
    pub fn record(&mut self, accepted: bool) {
        self.total_writes += 1;
        if !accepted {
            self.failed_writes += 1;
        }
    }

    pub fn reset(&mut self) {
        *self = WriteStatistics::default();
    }

    /// Fraction of attempts that failed, 0.0 when nothing was written.
    pub fn failure_ratio(&self) -> f64 {
        if self.total_writes == 0 {
            0.0
        } else {
            self.failed_writes as f64 / self.total_writes as f64
        }
    }
}
