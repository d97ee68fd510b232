//! Prometheus text exposition of engine metrics
//!
//! Served at /metrics by the HTTP server in `io::http`.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn write_gauge_f64(output: &mut String, name: &str, help: &str, site: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val:.6}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_cycle_metrics(&mut output, site_id, &summary);
    write_gate_metrics(&mut output, site_id, &summary);
    write_binding_metrics(&mut output, site_id, &summary);
    write_optimizer_metrics(&mut output, site_id, &summary);
    write_ingest_metrics(&mut output, site_id, &summary);

    output
}

fn write_cycle_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let outcomes = [
        ("gate_cycles_completed_total", "Recompute cycles that ran to completion", summary.cycles_completed),
        ("gate_cycles_noop_total", "Cycles with too few check-ins to act on", summary.cycles_noop),
        ("gate_cycles_skipped_total", "Cycles skipped because one was already running", summary.cycles_skipped),
        ("gate_cycles_cancelled_total", "Cycles stopped on request", summary.cycles_cancelled),
        ("gate_cycles_timed_out_total", "Cycles stopped at the deadline", summary.cycles_timed_out),
        ("gate_cycles_failed_total", "Cycles that failed to fetch check-ins or panicked", summary.cycles_failed),
    ];
    for (name, help, val) in outcomes {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }

    write_histogram(
        output,
        "gate_cycle_duration_ms",
        "Recompute cycle duration in milliseconds",
        site,
        &summary.cycle_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.cycle_duration_avg_ms,
    );
    write_metric(
        output,
        "gate_cycle_duration_p99_ms",
        "99th percentile cycle duration",
        MetricType::Gauge,
        site,
        summary.cycle_duration_p99_ms,
    );
    write_metric(
        output,
        "gate_cycle_duration_max_ms",
        "Maximum cycle duration since last scrape",
        MetricType::Gauge,
        site,
        summary.cycle_duration_max_ms,
    );
}

fn write_gate_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "gate_gates_created_total",
        "Gates discovered or declared",
        MetricType::Counter,
        site,
        summary.gates_created,
    );
    write_metric(
        output,
        "gate_gates_archived_total",
        "Gates auto-archived (stale, unhealthy or merged)",
        MetricType::Counter,
        site,
        summary.gates_archived,
    );
    write_metric(
        output,
        "gate_merges_auto_total",
        "Duplicate gates merged without review",
        MetricType::Counter,
        site,
        summary.merges_auto,
    );
    write_metric(
        output,
        "gate_merges_suggested_total",
        "Merge suggestions queued for review",
        MetricType::Counter,
        site,
        summary.merges_pending,
    );
}

fn write_binding_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let transitions = [
        ("gate_bindings_created_total", "Bindings entering probation", summary.bindings_created),
        ("gate_bindings_promoted_total", "Bindings promoted to enforced", summary.bindings_promoted),
        ("gate_bindings_demoted_total", "Bindings demoted to probation", summary.bindings_demoted),
        ("gate_bindings_rejected_total", "Bindings rejected", summary.bindings_rejected),
        ("gate_scans_processed_total", "Check-ins applied as binding evidence", summary.scans_processed),
        ("gate_decisions_recorded_total", "Decision explanations recorded", summary.decisions_recorded),
    ];
    for (name, help, val) in transitions {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }
}

fn write_optimizer_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "gate_optimizations_total",
        "Threshold optimizations evaluated",
        MetricType::Counter,
        site,
        summary.optimizations_run,
    );
    write_metric(
        output,
        "gate_optimizations_skipped_total",
        "Optimizations skipped (lock held or too little history)",
        MetricType::Counter,
        site,
        summary.optimizations_skipped,
    );
    write_metric(
        output,
        "gate_threshold_adjustments_total",
        "Threshold parameters changed by the optimizer",
        MetricType::Counter,
        site,
        summary.threshold_adjustments,
    );
}

fn write_ingest_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "gate_checkins_ingested_total",
        "Check-ins appended to the feed",
        MetricType::Counter,
        site,
        summary.checkins_ingested,
    );
    write_metric(
        output,
        "gate_checkins_malformed_total",
        "Check-in payloads dropped as malformed",
        MetricType::Counter,
        site,
        summary.checkins_malformed,
    );
    write_gauge_f64(
        output,
        "gate_checkins_per_sec",
        "Check-ins ingested per second since last scrape",
        site,
        summary.checkins_per_sec,
    );
}
