//! Per-gate activity over the learning window and the derived health score
//!
//! Health = 0.5 * success_rate + 0.25 * latency_score + 0.25 * uptime
//! - success_rate: share of the gate's window scans with a success outcome
//! - latency_score: 1 - min(1, median latency / latency budget)
//! - uptime: share of the event's active hours with at least one scan here

use crate::domain::gate::HealthScore;
use crate::domain::types::{CheckinEvent, CheckinStatus, GateId};
use crate::infra::config::HealthPolicy;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

const SUCCESS_WEIGHT: f64 = 0.5;
const LATENCY_WEIGHT: f64 = 0.25;
const UPTIME_WEIGHT: f64 = 0.25;

/// Hourly bins covering the learning window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HourlyWindow {
    pub start: DateTime<Utc>,
    pub bins: usize,
}

impl HourlyWindow {
    pub fn new(start: DateTime<Utc>, hours: u64) -> Self {
        Self { start, bins: hours.max(1) as usize }
    }

    /// Bin of a timestamp, clamped into the window
    pub fn bin(&self, at: DateTime<Utc>) -> usize {
        let hours = (at - self.start).num_hours().max(0) as usize;
        hours.min(self.bins - 1)
    }
}

/// What one gate saw during the window
#[derive(Debug, Clone, PartialEq)]
pub struct GateActivity {
    pub scans: u64,
    pub successes: u64,
    latencies_ms: Vec<u32>,
    /// Scan counts per hour of the window
    pub hourly: Vec<u32>,
}

impl GateActivity {
    pub fn new(bins: usize) -> Self {
        Self { scans: 0, successes: 0, latencies_ms: Vec::new(), hourly: vec![0; bins] }
    }

    pub fn record(&mut self, checkin: &CheckinEvent, bin: usize) {
        self.scans += 1;
        if checkin.status == CheckinStatus::Success {
            self.successes += 1;
        }
        if let Some(latency) = checkin.processing_latency_ms {
            self.latencies_ms.push(latency);
        }
        if let Some(slot) = self.hourly.get_mut(bin) {
            *slot += 1;
        }
    }

    /// Fold another gate's activity into this one
    pub fn absorb(&mut self, other: &GateActivity) {
        self.scans += other.scans;
        self.successes += other.successes;
        self.latencies_ms.extend_from_slice(&other.latencies_ms);
        for (a, b) in self.hourly.iter_mut().zip(other.hourly.iter()) {
            *a += b;
        }
    }

    pub fn median_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let mut sorted = self.latencies_ms.clone();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
        } else {
            sorted[mid] as f64
        })
    }
}

/// Activity per gate plus the event-wide span of active hours
#[derive(Debug, Clone)]
pub struct ActivityReport {
    pub window: HourlyWindow,
    pub gates: FxHashMap<GateId, GateActivity>,
    /// First and last hour bin with any scan at all, inclusive
    pub span: Option<(usize, usize)>,
}

impl ActivityReport {
    pub fn get(&self, gate: &GateId) -> Option<&GateActivity> {
        self.gates.get(gate)
    }

    pub fn scans(&self, gate: &GateId) -> u64 {
        self.gates.get(gate).map_or(0, |a| a.scans)
    }

    /// Hours between first and last scan of the event
    pub fn span_hours(&self) -> usize {
        self.span.map_or(0, |(first, last)| last - first + 1)
    }
}

/// Tally window scans per attributed gate
pub fn collect<'a, F>(checkins: &'a [CheckinEvent], window: HourlyWindow, mut gate_of: F) -> ActivityReport
where
    F: FnMut(&'a CheckinEvent) -> Option<&'a GateId>,
{
    let mut gates: FxHashMap<GateId, GateActivity> = FxHashMap::default();
    let mut span: Option<(usize, usize)> = None;

    for checkin in checkins {
        let bin = window.bin(checkin.timestamp);
        span = Some(match span {
            None => (bin, bin),
            Some((first, last)) => (first.min(bin), last.max(bin)),
        });
        if let Some(gate) = gate_of(checkin) {
            gates
                .entry(gate.clone())
                .or_insert_with(|| GateActivity::new(window.bins))
                .record(checkin, bin);
        }
    }

    ActivityReport { window, gates, span }
}

/// Health of a gate from its window activity; a gate with no scans keeps
/// its previous score
pub fn score(activity: &GateActivity, report: &ActivityReport, policy: &HealthPolicy) -> Option<HealthScore> {
    if activity.scans == 0 {
        return None;
    }
    let success_rate = activity.successes as f64 / activity.scans as f64;
    let latency_score = match activity.median_latency_ms() {
        Some(median) if policy.latency_budget_ms > 0.0 => {
            1.0 - (median / policy.latency_budget_ms).min(1.0)
        }
        _ => 1.0,
    };
    let uptime = match report.span {
        Some((first, last)) => {
            let active = activity.hourly[first..=last].iter().filter(|c| **c > 0).count();
            active as f64 / report.span_hours() as f64
        }
        None => 0.0,
    };
    let score = SUCCESS_WEIGHT * success_rate + LATENCY_WEIGHT * latency_score + UPTIME_WEIGHT * uptime;
    Some(HealthScore { score: score.clamp(0.0, 1.0), success_rate, latency_score, uptime })
}

/// Cosine similarity of two hourly traffic vectors; zero vectors score 0
pub fn traffic_similarity(a: &[u32], b: &[u32]) -> f64 {
    let (mut dot, mut na, mut nb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 16, 0, 0).unwrap()
    }

    fn checkin(id: usize, minutes: i64) -> CheckinEvent {
        CheckinEvent::new(format!("c{id}"), "ev", format!("w{id}"), "GA", start() + Duration::minutes(minutes))
    }

    #[test]
    fn test_bin_clamps_into_window() {
        let w = HourlyWindow::new(start(), 4);
        assert_eq!(w.bin(start() - Duration::minutes(5)), 0);
        assert_eq!(w.bin(start() + Duration::minutes(61)), 1);
        assert_eq!(w.bin(start() + Duration::hours(9)), 3);
    }

    #[test]
    fn test_score_combines_components() {
        let g1 = GateId::from("g1");
        let g2 = GateId::from("g2");
        let checkins = vec![
            checkin(1, 10).with_latency_ms(500),
            checkin(2, 20).with_latency_ms(1500).with_status(CheckinStatus::Denied),
            checkin(3, 130),
            checkin(4, 200),
        ];
        let window = HourlyWindow::new(start(), 4);
        let report = collect(&checkins, window, |c| {
            if c.id.as_str() == "c4" {
                Some(&g2)
            } else {
                Some(&g1)
            }
        });
        assert_eq!(report.span, Some((0, 3)));
        assert_eq!(report.span_hours(), 4);
        assert_eq!(report.scans(&g1), 3);

        let policy = HealthPolicy { latency_budget_ms: 2000.0, archive_floor: 0.2 };
        let health = score(report.get(&g1).unwrap(), &report, &policy).unwrap();
        assert!((health.success_rate - 2.0 / 3.0).abs() < 1e-9);
        // median of 500 and 1500
        assert!((health.latency_score - 0.5).abs() < 1e-9);
        // hours 0 and 2 of 0..=3
        assert!((health.uptime - 0.5).abs() < 1e-9);
        let expected = 0.5 * (2.0 / 3.0) + 0.25 * 0.5 + 0.25 * 0.5;
        assert!((health.score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_traffic_similarity() {
        assert!((traffic_similarity(&[1, 2, 3, 0], &[2, 4, 6, 0]) - 1.0).abs() < 1e-9);
        assert_eq!(traffic_similarity(&[5, 0, 0, 0], &[0, 0, 0, 5]), 0.0);
        assert_eq!(traffic_similarity(&[0, 0], &[1, 1]), 0.0);
        let s = traffic_similarity(&[10, 10, 0], &[10, 5, 5]);
        assert!(s > 0.8 && s < 0.9, "similarity {s}");
    }

    #[test]
    fn test_absorb_sums_activity() {
        let mut a = GateActivity::new(2);
        let mut b = GateActivity::new(2);
        a.record(&checkin(1, 0), 0);
        b.record(&checkin(2, 70).with_latency_ms(100), 1);
        a.absorb(&b);
        assert_eq!(a.scans, 2);
        assert_eq!(a.hourly, vec![1, 1]);
        assert_eq!(a.median_latency_ms(), Some(100.0));
    }
}
