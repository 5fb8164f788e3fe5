//! Metrics and observability for dataverse-sync.
//!
//! Counters are kept locally so a run can report a snapshot, and are also
//! emitted through the `metrics` facade for whatever recorder the host
//! installs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics collector for a sync run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Pages fetched
    pub pages_fetched: AtomicU64,
    /// Throttled responses retried
    pub throttle_retries: AtomicU64,
    /// Records fetched
    pub records_fetched: AtomicU64,
    /// Records written to staging
    pub records_loaded: AtomicU64,
    /// Transform statements run
    pub transforms_run: AtomicU64,
    /// Jobs committed
    pub jobs_succeeded: AtomicU64,
    /// Jobs rolled back
    pub jobs_failed: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fetched page.
    pub fn record_page(&self, records: u64) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
        self.records_fetched.fetch_add(records, Ordering::Relaxed);
        metrics::counter!("dataverse_sync_pages_total").increment(1);
        metrics::counter!("dataverse_sync_records_fetched_total").increment(records);
    }

    /// Record a throttled response.
    pub fn record_throttle(&self) {
        self.throttle_retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dataverse_sync_throttle_retries_total").increment(1);
    }

    /// Record rows appended to staging.
    pub fn record_loaded(&self, records: u64) {
        self.records_loaded.fetch_add(records, Ordering::Relaxed);
        metrics::counter!("dataverse_sync_records_loaded_total").increment(records);
    }

    /// Record a transform run.
    pub fn record_transform(&self) {
        self.transforms_run.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dataverse_sync_transforms_total").increment(1);
    }

    /// Record a job outcome.
    pub fn record_job(&self, success: bool) {
        if success {
            self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("dataverse_sync_jobs_total", "outcome" => "committed").increment(1);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("dataverse_sync_jobs_total", "outcome" => "rolled_back").increment(1);
        }
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            throttle_retries: self.throttle_retries.load(Ordering::Relaxed),
            records_fetched: self.records_fetched.load(Ordering::Relaxed),
            records_loaded: self.records_loaded.load(Ordering::Relaxed),
            transforms_run: self.transforms_run.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Pages fetched
    pub pages_fetched: u64,
    /// Throttled responses retried
    pub throttle_retries: u64,
    /// Records fetched
    pub records_fetched: u64,
    /// Records written to staging
    pub records_loaded: u64,
    /// Transform statements run
    pub transforms_run: u64,
    /// Jobs committed
    pub jobs_succeeded: u64,
    /// Jobs rolled back
    pub jobs_failed: u64,
}

impl MetricsSnapshot {
    /// Average records per page.
    pub fn records_per_page(&self) -> f64 {
        if self.pages_fetched == 0 {
            0.0
        } else {
            self.records_fetched as f64 / self.pages_fetched as f64
        }
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Start a new timer.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop timer and log duration.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
        elapsed
    }
}
