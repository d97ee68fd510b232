//! Lock-free engine metrics and periodic reporting
//!
//! Uses atomics for every recording operation so cycles running in parallel
//! for different events never contend on a mutex. Only `report()` swaps the
//! periodic counters.
//!
//! Counters use Relaxed ordering: they are statistics, never read to make
//! engine decisions.

use crate::services::engine::CycleReport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Cycle duration bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
const BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
const NUM_BUCKETS: usize = 11;

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

/// Compute bucket index for a duration value using binary search
#[inline]
fn bucket_index(duration_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < duration_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120, 10240];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    cycles_completed: AtomicU64,
    cycles_noop: AtomicU64,
    /// Triggers that found a cycle already running for the event
    cycles_skipped: AtomicU64,
    cycles_cancelled: AtomicU64,
    cycles_timed_out: AtomicU64,
    /// Cycles that could not fetch their check-in snapshot
    cycles_failed: AtomicU64,
    /// Cycle duration histogram (cumulative)
    cycle_duration_buckets: [AtomicU64; NUM_BUCKETS],
    cycle_duration_sum_ms: AtomicU64,
    /// Max cycle duration (reset on report)
    cycle_duration_max_ms: AtomicU64,
    gates_created: AtomicU64,
    gates_archived: AtomicU64,
    bindings_created: AtomicU64,
    bindings_promoted: AtomicU64,
    bindings_demoted: AtomicU64,
    bindings_rejected: AtomicU64,
    merges_auto: AtomicU64,
    merges_pending: AtomicU64,
    scans_processed: AtomicU64,
    optimizations_run: AtomicU64,
    optimizations_skipped: AtomicU64,
    threshold_adjustments: AtomicU64,
    checkins_ingested: AtomicU64,
    /// Check-ins since last report (reset on report)
    checkins_since_report: AtomicU64,
    checkins_malformed: AtomicU64,
    decisions_recorded: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cycles_completed: AtomicU64::new(0),
            cycles_noop: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            cycles_cancelled: AtomicU64::new(0),
            cycles_timed_out: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            cycle_duration_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            cycle_duration_sum_ms: AtomicU64::new(0),
            cycle_duration_max_ms: AtomicU64::new(0),
            gates_created: AtomicU64::new(0),
            gates_archived: AtomicU64::new(0),
            bindings_created: AtomicU64::new(0),
            bindings_promoted: AtomicU64::new(0),
            bindings_demoted: AtomicU64::new(0),
            bindings_rejected: AtomicU64::new(0),
            merges_auto: AtomicU64::new(0),
            merges_pending: AtomicU64::new(0),
            scans_processed: AtomicU64::new(0),
            optimizations_run: AtomicU64::new(0),
            optimizations_skipped: AtomicU64::new(0),
            threshold_adjustments: AtomicU64::new(0),
            checkins_ingested: AtomicU64::new(0),
            checkins_since_report: AtomicU64::new(0),
            checkins_malformed: AtomicU64::new(0),
            decisions_recorded: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record the counters and duration of a finished (possibly partial) cycle
    pub fn record_cycle(&self, report: &CycleReport, outcome: CycleKind) {
        let counter = match outcome {
            CycleKind::Completed => &self.cycles_completed,
            CycleKind::NoOp => &self.cycles_noop,
            CycleKind::Cancelled => &self.cycles_cancelled,
            CycleKind::TimedOut => &self.cycles_timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let duration_ms = report.duration_ms;
        self.cycle_duration_buckets[bucket_index(duration_ms)].fetch_add(1, Ordering::Relaxed);
        self.cycle_duration_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        update_atomic_max(&self.cycle_duration_max_ms, duration_ms);

        self.gates_created.fetch_add(report.gates_created as u64, Ordering::Relaxed);
        self.gates_archived.fetch_add(report.gates_archived as u64, Ordering::Relaxed);
        self.bindings_created.fetch_add(report.bindings_created as u64, Ordering::Relaxed);
        self.bindings_promoted.fetch_add(report.promotions as u64, Ordering::Relaxed);
        self.bindings_demoted.fetch_add(report.demotions as u64, Ordering::Relaxed);
        self.bindings_rejected.fetch_add(report.rejections as u64, Ordering::Relaxed);
        self.merges_auto.fetch_add(report.merges_executed as u64, Ordering::Relaxed);
        self.merges_pending.fetch_add(report.merges_suggested as u64, Ordering::Relaxed);
        self.scans_processed.fetch_add(report.scans_processed as u64, Ordering::Relaxed);
        self.decisions_recorded.fetch_add(report.decisions.len() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cycle_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cycle_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an optimization run and how many parameters it moved
    #[inline]
    pub fn record_optimization(&self, adjustments: usize, decisions: usize) {
        self.optimizations_run.fetch_add(1, Ordering::Relaxed);
        self.threshold_adjustments.fetch_add(adjustments as u64, Ordering::Relaxed);
        self.decisions_recorded.fetch_add(decisions as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_optimization_skipped(&self) {
        self.optimizations_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_checkin_ingested(&self) {
        self.checkins_ingested.fetch_add(1, Ordering::Relaxed);
        self.checkins_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_checkin_malformed(&self) {
        self.checkins_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn cycles_skipped(&self) -> u64 {
        self.cycles_skipped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn checkins_ingested(&self) -> u64 {
        self.checkins_ingested.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let checkins_count = self.checkins_since_report.swap(0, Ordering::Relaxed);
        let cycle_duration_max_ms = self.cycle_duration_max_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let checkins_per_sec = if elapsed.as_secs_f64() > 0.0 {
            checkins_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let cycle_buckets = load_buckets(&self.cycle_duration_buckets);
        let cycle_count: u64 = cycle_buckets.iter().sum();
        let cycle_sum = self.cycle_duration_sum_ms.load(Ordering::Relaxed);
        let cycle_duration_avg_ms = if cycle_count > 0 { cycle_sum / cycle_count } else { 0 };

        MetricsSummary {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_noop: self.cycles_noop.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            cycles_cancelled: self.cycles_cancelled.load(Ordering::Relaxed),
            cycles_timed_out: self.cycles_timed_out.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            cycle_buckets,
            cycle_duration_avg_ms,
            cycle_duration_max_ms,
            cycle_duration_p99_ms: percentile_from_buckets(&cycle_buckets, 0.99),
            gates_created: self.gates_created.load(Ordering::Relaxed),
            gates_archived: self.gates_archived.load(Ordering::Relaxed),
            bindings_created: self.bindings_created.load(Ordering::Relaxed),
            bindings_promoted: self.bindings_promoted.load(Ordering::Relaxed),
            bindings_demoted: self.bindings_demoted.load(Ordering::Relaxed),
            bindings_rejected: self.bindings_rejected.load(Ordering::Relaxed),
            merges_auto: self.merges_auto.load(Ordering::Relaxed),
            merges_pending: self.merges_pending.load(Ordering::Relaxed),
            scans_processed: self.scans_processed.load(Ordering::Relaxed),
            optimizations_run: self.optimizations_run.load(Ordering::Relaxed),
            optimizations_skipped: self.optimizations_skipped.load(Ordering::Relaxed),
            threshold_adjustments: self.threshold_adjustments.load(Ordering::Relaxed),
            checkins_ingested: self.checkins_ingested.load(Ordering::Relaxed),
            checkins_per_sec,
            checkins_malformed: self.checkins_malformed.load(Ordering::Relaxed),
            decisions_recorded: self.decisions_recorded.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// How a cycle ended, for counter selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Completed,
    NoOp,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub cycles_completed: u64,
    pub cycles_noop: u64,
    pub cycles_skipped: u64,
    pub cycles_cancelled: u64,
    pub cycles_timed_out: u64,
    pub cycles_failed: u64,
    /// Cycle duration histogram buckets
    /// Bounds: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120 ms
    pub cycle_buckets: [u64; NUM_BUCKETS],
    pub cycle_duration_avg_ms: u64,
    pub cycle_duration_max_ms: u64,
    pub cycle_duration_p99_ms: u64,
    pub gates_created: u64,
    pub gates_archived: u64,
    pub bindings_created: u64,
    pub bindings_promoted: u64,
    pub bindings_demoted: u64,
    pub bindings_rejected: u64,
    pub merges_auto: u64,
    pub merges_pending: u64,
    pub scans_processed: u64,
    pub optimizations_run: u64,
    pub optimizations_skipped: u64,
    pub threshold_adjustments: u64,
    pub checkins_ingested: u64,
    pub checkins_per_sec: f64,
    pub checkins_malformed: u64,
    pub decisions_recorded: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            cycles = %self.cycles_completed,
            noop = %self.cycles_noop,
            skipped = %self.cycles_skipped,
            cancelled = %self.cycles_cancelled,
            timed_out = %self.cycles_timed_out,
            failed = %self.cycles_failed,
            cycle_avg_ms = %self.cycle_duration_avg_ms,
            cycle_p99_ms = %self.cycle_duration_p99_ms,
            gates_created = %self.gates_created,
            gates_archived = %self.gates_archived,
            promoted = %self.bindings_promoted,
            demoted = %self.bindings_demoted,
            rejected = %self.bindings_rejected,
            merges_auto = %self.merges_auto,
            merges_pending = %self.merges_pending,
            checkins_per_sec = format!("{:.1}", self.checkins_per_sec),
            decisions = %self.decisions_recorded,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(10), 0);
        assert_eq!(bucket_index(11), 1);
        assert_eq!(bucket_index(5120), 9);
        assert_eq!(bucket_index(99_999), 10);
    }

    #[test]
    fn test_percentile_from_buckets() {
        let mut buckets = [0u64; NUM_BUCKETS];
        buckets[2] = 99;
        buckets[8] = 1;
        assert_eq!(percentile_from_buckets(&buckets, 0.5), 40);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 40);
        assert_eq!(percentile_from_buckets(&[0; NUM_BUCKETS], 0.99), 0);
    }

    #[test]
    fn test_record_cycle_updates_counters() {
        let metrics = Metrics::new();
        let report = CycleReport {
            gates_created: 2,
            promotions: 1,
            merges_executed: 1,
            duration_ms: 35,
            ..Default::default()
        };
        metrics.record_cycle(&report, CycleKind::Completed);
        metrics.record_cycle_skipped();

        let summary = metrics.report();
        assert_eq!(summary.cycles_completed, 1);
        assert_eq!(summary.cycles_skipped, 1);
        assert_eq!(summary.gates_created, 2);
        assert_eq!(summary.bindings_promoted, 1);
        assert_eq!(summary.merges_auto, 1);
        assert_eq!(summary.cycle_buckets[2], 1);
        assert_eq!(summary.cycle_duration_max_ms, 35);

        // Max is periodic, totals are monotonic
        let summary = metrics.report();
        assert_eq!(summary.cycle_duration_max_ms, 0);
        assert_eq!(summary.cycles_completed, 1);
    }

    #[test]
    fn test_checkin_rate_resets() {
        let metrics = Metrics::new();
        metrics.record_checkin_ingested();
        metrics.record_checkin_ingested();
        assert_eq!(metrics.checkins_ingested(), 2);
        let _ = metrics.report();
        assert_eq!(metrics.checkins_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.checkins_ingested(), 2);
    }
}
