//! Pipeline statistics
//!
//! Counters are atomics so a monitoring thread can read them through a
//! [`SharedStats`] handle while the controller runs.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared statistics handle
pub type SharedStats = Arc<PipelineStats>;

/// Counters for one controller
#[derive(Debug)]
pub struct PipelineStats {
    start_time: Instant,
    /// Submissions made
    passes: AtomicU64,
    /// Units submitted across all passes
    units_submitted: AtomicU64,
    /// Valid results handed back to the caller
    results_retrieved: AtomicU64,
    /// Units carried by those results
    units_retrieved: AtomicU64,
    /// Bytes exposed to the host by map operations
    bytes_mapped: AtomicU64,
    /// Sum of completion waits in microseconds
    total_wait_us: AtomicU64,
    /// Longest completion wait in microseconds
    max_wait_us: AtomicU64,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            passes: AtomicU64::new(0),
            units_submitted: AtomicU64::new(0),
            results_retrieved: AtomicU64::new(0),
            units_retrieved: AtomicU64::new(0),
            bytes_mapped: AtomicU64::new(0),
            total_wait_us: AtomicU64::new(0),
            max_wait_us: AtomicU64::new(0),
        }
    }

    /// Record a completed submission
    pub fn record_pass(&self, units: usize, wait: Duration) {
        let wait_us = wait.as_micros() as u64;
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.units_submitted.fetch_add(units as u64, Ordering::Relaxed);
        self.total_wait_us.fetch_add(wait_us, Ordering::Relaxed);
        self.max_wait_us.fetch_max(wait_us, Ordering::Relaxed);
    }

    /// Record a valid result handed to the caller
    pub fn record_result(&self, units: usize) {
        self.results_retrieved.fetch_add(1, Ordering::Relaxed);
        self.units_retrieved.fetch_add(units as u64, Ordering::Relaxed);
    }

    /// Record a host mapping
    pub fn record_mapped(&self, bytes: usize) {
        self.bytes_mapped.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Submissions made
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Units submitted
    pub fn units_submitted(&self) -> u64 {
        self.units_submitted.load(Ordering::Relaxed)
    }

    /// Valid results retrieved
    pub fn results_retrieved(&self) -> u64 {
        self.results_retrieved.load(Ordering::Relaxed)
    }

    /// Units carried by retrieved results
    pub fn units_retrieved(&self) -> u64 {
        self.units_retrieved.load(Ordering::Relaxed)
    }

    /// Bytes mapped for the host
    pub fn bytes_mapped(&self) -> u64 {
        self.bytes_mapped.load(Ordering::Relaxed)
    }

    /// Average completion wait
    pub fn avg_wait(&self) -> Duration {
        let passes = self.passes();
        if passes == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_wait_us.load(Ordering::Relaxed) / passes)
    }

    /// Longest completion wait
    pub fn max_wait(&self) -> Duration {
        Duration::from_micros(self.max_wait_us.load(Ordering::Relaxed))
    }

    /// Time since the stats were created
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time snapshot
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            passes: self.passes(),
            units_submitted: self.units_submitted(),
            results_retrieved: self.results_retrieved(),
            units_retrieved: self.units_retrieved(),
            bytes_mapped: self.bytes_mapped(),
            avg_wait_us: self.avg_wait().as_micros() as u64,
            max_wait_us: self.max_wait().as_micros() as u64,
            elapsed_ms: self.elapsed().as_millis() as u64,
        }
    }
}

/// Serializable statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    /// Submissions made
    pub passes: u64,
    /// Units submitted
    pub units_submitted: u64,
    /// Valid results retrieved
    pub results_retrieved: u64,
    /// Units carried by retrieved results
    pub units_retrieved: u64,
    /// Bytes mapped for the host
    pub bytes_mapped: u64,
    /// Average completion wait in microseconds
    pub avg_wait_us: u64,
    /// Longest completion wait in microseconds
    pub max_wait_us: u64,
    /// Wall time since creation in milliseconds
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats() {
        let stats = PipelineStats::new();
        assert_eq!(stats.passes(), 0);
        assert_eq!(stats.avg_wait(), Duration::ZERO);
        assert_eq!(stats.max_wait(), Duration::ZERO);
    }

    #[test]
    fn test_record_pass() {
        let stats = PipelineStats::new();
        stats.record_pass(5, Duration::from_micros(100));
        stats.record_pass(3, Duration::from_micros(300));

        assert_eq!(stats.passes(), 2);
        assert_eq!(stats.units_submitted(), 8);
        assert_eq!(stats.avg_wait(), Duration::from_micros(200));
        assert_eq!(stats.max_wait(), Duration::from_micros(300));
    }

    #[test]
    fn test_summary_serializes() {
        let stats = PipelineStats::new();
        stats.record_result(4);
        stats.record_mapped(1024);

        let summary = stats.summary();
        assert_eq!(summary.results_retrieved, 1);
        assert_eq!(summary.units_retrieved, 4);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["bytes_mapped"], 1024);
    }
}
