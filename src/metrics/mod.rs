//! Metrics for cursor establishment.
//!
//! Counters track how establish calls end and what happened to each shard;
//! cleanup failures are counted here rather than surfaced to callers.
//!
//! # Example
//!
//! ```rust
//! use shard_cursors::metrics::EstablishMetrics;
//! use std::time::Duration;
//!
//! let metrics = EstablishMetrics::new();
//! metrics.record_success(3, Duration::from_millis(12));
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.cursors_established, 3);
//! ```

mod counters;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use histograms::{Histogram, HistogramSnapshot, ESTABLISH_LATENCY_BUCKETS};

use crate::error::ErrorCode;
use std::time::Duration;

/// Metrics for scatter-gather cursor establishment.
#[derive(Debug)]
pub struct EstablishMetrics {
    /// Establish calls started.
    pub establish_total: Counter,
    /// Establish calls that returned cursors.
    pub establish_success: Counter,
    /// Establish calls that returned an error.
    pub establish_failures: Counter,
    /// Cursors returned to callers.
    pub cursors_established: Counter,
    /// Shards left out of a partial result.
    pub shards_skipped: Counter,
    /// Close-cursor commands handed to the executor.
    pub cleanup_scheduled: Counter,
    /// Close-cursor commands that could not be submitted.
    pub cleanup_submission_failures: Counter,
    /// Establish call latency.
    pub establish_latency: Histogram,
    /// Per-shard failures by code, fatal or skipped.
    pub errors: LabeledCounter<1>,
}

impl EstablishMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            establish_total: Counter::new("establish_total", "Establish calls started"),
            establish_success: Counter::new("establish_success", "Successful establish calls"),
            establish_failures: Counter::new("establish_failures", "Failed establish calls"),
            cursors_established: Counter::new(
                "cursors_established",
                "Cursors returned to callers",
            ),
            shards_skipped: Counter::new(
                "shards_skipped",
                "Shards omitted from partial results",
            ),
            cleanup_scheduled: Counter::new(
                "cleanup_scheduled",
                "Close-cursor commands scheduled",
            ),
            cleanup_submission_failures: Counter::new(
                "cleanup_submission_failures",
                "Close-cursor commands that could not be submitted",
            ),
            establish_latency: Histogram::with_buckets(
                "establish_latency_seconds",
                "Establish call latency",
                ESTABLISH_LATENCY_BUCKETS.to_vec(),
            ),
            errors: LabeledCounter::new(
                "establish_shard_errors",
                "Per-shard establish errors by code",
                ["code"],
            ),
        }
    }

    /// Record the start of an establish call.
    pub fn record_start(&self) {
        self.establish_total.inc();
    }

    /// Record a successful establish call.
    pub fn record_success(&self, cursors: usize, latency: Duration) {
        self.establish_success.inc();
        self.cursors_established.inc_by(cursors as u64);
        self.establish_latency.observe_duration(latency);
    }

    /// Record a failed establish call.
    pub fn record_failure(&self, latency: Duration) {
        self.establish_failures.inc();
        self.establish_latency.observe_duration(latency);
    }

    /// Record a per-shard error.
    pub fn record_shard_error(&self, code: ErrorCode) {
        self.errors.inc([code.to_string().as_str()]);
    }

    /// Record a shard dropped from a partial result.
    pub fn record_skipped(&self, code: ErrorCode) {
        self.shards_skipped.inc();
        self.record_shard_error(code);
    }

    /// Get a snapshot of the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            establish_total: self.establish_total.get(),
            establish_success: self.establish_success.get(),
            establish_failures: self.establish_failures.get(),
            cursors_established: self.cursors_established.get(),
            shards_skipped: self.shards_skipped.get(),
            cleanup_scheduled: self.cleanup_scheduled.get(),
            cleanup_submission_failures: self.cleanup_submission_failures.get(),
            establish_latency: self.establish_latency.snapshot(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        for counter in [
            &self.establish_total,
            &self.establish_success,
            &self.establish_failures,
            &self.cursors_established,
            &self.shards_skipped,
            &self.cleanup_scheduled,
            &self.cleanup_submission_failures,
        ] {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
                name = counter.name(),
                help = counter.help(),
                value = counter.get()
            ));
        }

        output.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n",
            name = self.errors.name(),
            help = self.errors.help()
        ));
        for ([code], value) in self.errors.get_all() {
            output.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                self.errors.name(),
                self.errors.label_names()[0],
                code,
                value
            ));
        }

        let latency = self.establish_latency.snapshot();
        output.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} histogram\n{name}_sum {sum}\n{name}_count {count}\n",
            name = self.establish_latency.name(),
            help = self.establish_latency.help(),
            sum = latency.sum,
            count = latency.count
        ));

        output
    }
}

impl Default for EstablishMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of establish metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub establish_total: u64,
    pub establish_success: u64,
    pub establish_failures: u64,
    pub cursors_established: u64,
    pub shards_skipped: u64,
    pub cleanup_scheduled: u64,
    pub cleanup_submission_failures: u64,
    pub establish_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Fraction of finished establish calls that succeeded.
    pub fn success_rate(&self) -> f64 {
        let finished = self.establish_success + self.establish_failures;
        if finished == 0 {
            0.0
        } else {
            self.establish_success as f64 / finished as f64
        }
    }
}
