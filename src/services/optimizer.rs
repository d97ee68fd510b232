//! Threshold optimizer
//!
//! Re-tunes an event's AdaptiveThresholds from finalized decision history.
//! Runs on its own schedule and lock: it reads the audit log and gate
//! snapshot and only writes thresholds, so it never races a recompute cycle.
//!
//! Rules, first match wins:
//! 1. accuracy below target and clusters loose → tighten epsilon and raise
//!    promotion_sample_size
//! 2. accuracy below target → raise confidence_threshold
//! 3. many low-sample gates crowding each other → loosen epsilon

use crate::domain::decision::{
    ConfidenceBreakdown, DecisionExplanation, DecisionKind, DecisionSubject, Factor,
};
use crate::domain::gate::Gate;
use crate::domain::geo;
use crate::domain::thresholds::{AdaptiveThresholds, OptimizationEntry, ThresholdParameter};
use crate::infra::config::OptimizerPolicy;
use crate::services::decision_recorder::{DecisionRecorder, Factors};
use chrono::{DateTime, Duration, Utc};
use smallvec::smallvec;
use tracing::{debug, info};

const EPS_BOUNDS: (f64, f64) = (5.0, 200.0);
const PROMOTION_BOUNDS: (f64, f64) = (10.0, 1000.0);
const CONFIDENCE_BOUNDS: (f64, f64) = (0.5, 0.99);

/// Result of one optimization run
#[derive(Debug, Clone, PartialEq)]
pub enum Optimization {
    /// Too few promotions in the window to judge accuracy
    InsufficientData { promotions: usize },
    Evaluated { accuracy: f64, promotions: usize, entries: Vec<OptimizationEntry> },
}

/// Promotions in the window and the share never followed by a demotion or
/// rejection of the same binding
pub fn decision_accuracy(decisions: &[DecisionExplanation], from: DateTime<Utc>) -> (usize, f64) {
    let mut promotions = 0usize;
    let mut held = 0usize;
    for (i, decision) in decisions.iter().enumerate() {
        if decision.kind != DecisionKind::Promoted || decision.at < from {
            continue;
        }
        let DecisionSubject::Binding { key } = &decision.subject else {
            continue;
        };
        promotions += 1;
        let reverted = decisions[i + 1..].iter().any(|later| {
            matches!(later.kind, DecisionKind::Demoted | DecisionKind::Rejected)
                && matches!(&later.subject, DecisionSubject::Binding { key: k } if k == key)
        });
        if !reverted {
            held += 1;
        }
    }
    let accuracy = if promotions == 0 { 0.0 } else { held as f64 / promotions as f64 };
    (promotions, accuracy)
}

/// Mean spatial variance of live gates relative to eps²
pub fn variance_ratio(gates: &[Gate], eps_m: f64) -> f64 {
    let live: Vec<&Gate> = gates.iter().filter(|g| g.is_live()).collect();
    if live.is_empty() {
        return 0.0;
    }
    let mean = live.iter().map(|g| g.spatial_variance).sum::<f64>() / live.len() as f64;
    mean / (eps_m * eps_m)
}

/// Share of live gates that are low-sample and have a live neighbour
/// within 2·eps
pub fn fragmentation(gates: &[Gate], eps_m: f64, min_samples: usize) -> f64 {
    let live: Vec<&Gate> = gates.iter().filter(|g| g.is_live()).collect();
    if live.is_empty() {
        return 0.0;
    }
    let crowded = live
        .iter()
        .filter(|g| (g.window_sample_count as usize) < min_samples)
        .filter(|g| {
            live.iter()
                .any(|o| o.id != g.id && geo::distance_m(g.centroid, o.centroid) <= 2.0 * eps_m)
        })
        .count();
    crowded as f64 / live.len() as f64
}

/// Move a value by at most `fraction` toward the bound, never past it
fn bounded_step(old: f64, fraction: f64, increase: bool, bounds: (f64, f64)) -> Option<f64> {
    let (lo, hi) = bounds;
    let target = if increase { old * (1.0 + fraction) } else { old * (1.0 - fraction) };
    let new = target.clamp(lo.min(old), hi.max(old));
    ((new - old).abs() > 1e-9).then_some(new)
}

pub struct ThresholdOptimizer<'a> {
    policy: &'a OptimizerPolicy,
    window: Duration,
}

impl<'a> ThresholdOptimizer<'a> {
    pub fn new(policy: &'a OptimizerPolicy, window: Duration) -> Self {
        Self { policy, window }
    }

    /// Evaluate the window and adjust `thresholds` in place
    ///
    /// The caller validates and stores the result.
    pub fn run(
        &self,
        thresholds: &mut AdaptiveThresholds,
        decisions: &[DecisionExplanation],
        gates: &[Gate],
        now: DateTime<Utc>,
        recorder: &mut DecisionRecorder,
    ) -> Optimization {
        let (promotions, accuracy) = decision_accuracy(decisions, now - self.window);
        if promotions < self.policy.min_decisions {
            debug!(
                event_id = %recorder.event_id(),
                promotions = %promotions,
                min = %self.policy.min_decisions,
                "optimization_insufficient_data"
            );
            return Optimization::InsufficientData { promotions };
        }

        let eps = thresholds.duplicate_distance_meters;
        let variance = variance_ratio(gates, eps);
        let fragmented = fragmentation(gates, eps, thresholds.min_cluster_samples);
        let improvement = accuracy - thresholds.last_measured_accuracy.unwrap_or(accuracy);
        let step = self.policy.max_step_fraction.clamp(0.0, 1.0);

        let mut changes: Vec<(ThresholdParameter, f64, String)> = Vec::new();
        if accuracy < self.policy.target_accuracy {
            if variance > self.policy.high_variance_ratio {
                let reason = format!(
                    "accuracy {:.0}% below target {:.0}% with loose clusters (variance/eps² {:.2})",
                    accuracy * 100.0,
                    self.policy.target_accuracy * 100.0,
                    variance
                );
                if let Some(v) = bounded_step(eps, step, false, EPS_BOUNDS) {
                    changes.push((ThresholdParameter::DuplicateDistanceMeters, v, reason.clone()));
                }
                let promo = thresholds.promotion_sample_size as f64;
                if let Some(v) = bounded_step(promo, step, true, PROMOTION_BOUNDS) {
                    // Integer parameter: round inside the step, but move by at least one
                    let v = v.floor().max(promo + 1.0).min(PROMOTION_BOUNDS.1);
                    if v > promo {
                        changes.push((ThresholdParameter::PromotionSampleSize, v, reason));
                    }
                }
            } else if let Some(v) =
                bounded_step(thresholds.confidence_threshold, step, true, CONFIDENCE_BOUNDS)
            {
                let reason = format!(
                    "accuracy {:.0}% below target {:.0}%",
                    accuracy * 100.0,
                    self.policy.target_accuracy * 100.0
                );
                changes.push((ThresholdParameter::ConfidenceThreshold, v, reason));
            }
        } else if fragmented > self.policy.fragmentation_ratio {
            if let Some(v) = bounded_step(eps, step, true, EPS_BOUNDS) {
                let reason = format!(
                    "{:.0}% of gates are low-sample near-duplicates",
                    fragmented * 100.0
                );
                changes.push((ThresholdParameter::DuplicateDistanceMeters, v, reason));
            }
        }

        let mut entries = Vec::with_capacity(changes.len());
        for (parameter, new_value, reason) in changes {
            let old_value = thresholds.value_of(parameter);
            thresholds.set_value(parameter, new_value);
            let entry = OptimizationEntry {
                parameter,
                old_value,
                new_value: thresholds.value_of(parameter),
                reason,
                performance_improvement: improvement,
                timestamp: now,
            };
            recorder.record(
                DecisionKind::ThresholdAdjusted,
                DecisionSubject::Thresholds,
                adjustment_factors(&entry, accuracy, self.policy.target_accuracy, variance, fragmented),
                ConfidenceBreakdown::new(
                    1.0 - variance.min(1.0),
                    promotions as f64 / (2 * self.policy.min_decisions.max(1)) as f64,
                    accuracy,
                    1.0 - fragmented,
                ),
                now,
            );
            info!(
                event_id = %recorder.event_id(),
                parameter = %parameter.as_str(),
                old = %entry.old_value,
                new = %entry.new_value,
                accuracy = format!("{:.3}", accuracy),
                "threshold_adjusted"
            );
            thresholds.optimization_history.push(entry.clone());
            entries.push(entry);
        }

        thresholds.last_optimization_at = Some(now);
        thresholds.last_measured_accuracy = Some(accuracy);
        if !entries.is_empty() {
            thresholds.version += 1;
        }

        Optimization::Evaluated { accuracy, promotions, entries }
    }
}

fn adjustment_factors(
    entry: &OptimizationEntry,
    accuracy: f64,
    target: f64,
    variance: f64,
    fragmented: f64,
) -> Factors {
    smallvec![
        Factor::new(entry.parameter.as_str(), entry.new_value, 0.0, 0.0)
            .with_detail(format!("{} {} -> {}", entry.parameter.as_str(), entry.old_value, entry.new_value)),
        Factor::new("accuracy", accuracy, 1.0, accuracy - target).with_detail(entry.reason.clone()),
        Factor::new("variance_ratio", variance, 0.5, -0.5 * variance.min(1.0)),
        Factor::new("fragmentation", fragmented, 0.5, -0.5 * fragmented),
    ]
}
