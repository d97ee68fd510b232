//! Binding tracker - per (gate, category) confidence state machine
//!
//! ```text
//! (none) --first scan--> probation --promote--> enforced
//!                            ^                      |
//!                            +-------demote---------+
//! probation | enforced --reject--> rejected (terminal)
//! ```
//!
//! Purely an after-the-fact updater: it never blocks a live check-in. The
//! check-in router enforces bindings by reading the resulting state.

use crate::domain::binding::{BindingKey, BindingStatus, GateBinding};
use crate::domain::decision::{ConfidenceBreakdown, DecisionKind, Factor};
use crate::domain::thresholds::AdaptiveThresholds;
use crate::domain::types::{Category, GateId};
use crate::infra::config::BindingPolicy;
use crate::services::decision_recorder::{DecisionRecorder, Factors};
use chrono::{DateTime, Utc};
use smallvec::smallvec;
use std::collections::BTreeMap;
use tracing::debug;

/// Bindings of one event, ordered by (gate, category)
pub type BindingMap = BTreeMap<BindingKey, GateBinding>;

/// Why a scan contradicts a binding
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    /// Scan landed near the gate but outside epsilon
    Geospatial { distance_m: f64 },
    /// Implied walking speed from the wristband's previous scan is implausible
    Temporal { speed_mps: f64 },
    /// A scan of a category not enforced at this gate
    CrossCategory { category: Category },
}

impl Violation {
    fn describe(&self) -> String {
        match self {
            Violation::Geospatial { distance_m } => {
                format!("scan {distance_m:.0}m from gate centroid")
            }
            Violation::Temporal { speed_mps } => {
                format!("wristband moved at {speed_mps:.1} m/s since its previous scan")
            }
            Violation::CrossCategory { category } => {
                format!("{category} scan at a gate not enforced for {category}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evidence {
    /// Scan agrees with the gate's learned profile, weighted
    Consistent { weight: f64 },
    Violation(Violation),
}

/// Applies evidence to bindings under the current thresholds
pub struct BindingTracker<'a> {
    policy: &'a BindingPolicy,
    thresholds: &'a AdaptiveThresholds,
}

impl<'a> BindingTracker<'a> {
    pub fn new(policy: &'a BindingPolicy, thresholds: &'a AdaptiveThresholds) -> Self {
        Self { policy, thresholds }
    }

    /// Evidence weight for a consistent scan
    pub fn consistent(&self, located: bool) -> Evidence {
        let weight = if located { self.policy.evidence_weight } else { self.policy.evidence_weight / 2.0 };
        Evidence::Consistent { weight }
    }

    /// Apply one scan of `category` at `gate`
    ///
    /// Creates the binding in probation on first sight. A consistent scan of a
    /// category that is not enforced here also counts as a violation against
    /// every other enforced binding at the gate.
    pub fn observe(
        &self,
        bindings: &mut BindingMap,
        gate: &GateId,
        category: &Category,
        evidence: Evidence,
        at: DateTime<Utc>,
        recorder: &mut DecisionRecorder,
    ) {
        let key = BindingKey::new(gate.clone(), category.clone());
        let was_enforced = bindings.get(&key).is_some_and(GateBinding::is_enforced);

        if !bindings.contains_key(&key) {
            let binding = GateBinding::probation(gate.clone(), category.clone(), at);
            let share = category_share(bindings, gate, 0);
            recorder.binding(
                DecisionKind::Created,
                key.clone(),
                smallvec![Factor::new("first_scan", 1.0, 1.0, 1.0)
                    .with_detail(format!("first {category} scan at gate {gate}"))],
                breakdown(&binding, self.thresholds, share),
                at,
            );
            bindings.insert(key.clone(), binding);
        }

        let cross_category = matches!(evidence, Evidence::Consistent { .. }) && !was_enforced;

        if let Some(binding) = bindings.get_mut(&key) {
            self.apply(binding, &evidence, at);
        }
        self.evaluate(bindings, &key, at, recorder);

        if cross_category {
            let others: Vec<BindingKey> = gate_bindings(bindings, gate)
                .filter(|b| b.is_enforced() && &b.category != category)
                .map(GateBinding::key)
                .collect();
            let violation = Evidence::Violation(Violation::CrossCategory { category: category.clone() });
            for other in others {
                if let Some(binding) = bindings.get_mut(&other) {
                    self.apply(binding, &violation, at);
                }
                self.evaluate(bindings, &other, at, recorder);
            }
        }
    }

    /// Update counters and confidence; rejected bindings ignore evidence
    pub fn apply(&self, binding: &mut GateBinding, evidence: &Evidence, at: DateTime<Utc>) {
        if binding.is_rejected() {
            return;
        }
        match evidence {
            Evidence::Consistent { weight } => {
                binding.sample_count += 1;
                binding.confidence += (1.0 - binding.confidence) * weight.clamp(0.0, 1.0);
            }
            Evidence::Violation(violation) => {
                binding.violation_count += 1;
                binding.confidence = (binding.confidence - self.policy.violation_step).max(0.0);
                binding.last_violation_at = Some(at);
                debug!(
                    binding = %binding.key(),
                    violation = %violation.describe(),
                    violations = %binding.violation_count,
                    "binding_violation"
                );
            }
        }
        binding.confidence = binding.confidence.clamp(0.0, 1.0);

        if binding.confidence < self.policy.rejection_confidence_floor {
            binding.low_confidence_since.get_or_insert(at);
        } else {
            binding.low_confidence_since = None;
        }
        binding.updated_at = at;
    }

    /// Fire at most one transition for the binding, recording it
    pub fn evaluate(
        &self,
        bindings: &mut BindingMap,
        key: &BindingKey,
        at: DateTime<Utc>,
        recorder: &mut DecisionRecorder,
    ) -> Option<BindingStatus> {
        let binding = bindings.get(key)?;
        let (kind, next, factors) = self.transition(binding, at)?;
        let share = category_share(bindings, &key.gate, binding.sample_count);
        let confidence = breakdown(binding, self.thresholds, share);

        recorder.binding(kind, key.clone(), factors, confidence, at);
        let binding = bindings.get_mut(key)?;
        binding.status = next;
        binding.updated_at = at;
        if next == BindingStatus::Enforced {
            binding.bound_at = at;
        }
        Some(next)
    }

    /// Whether promotion preconditions hold
    pub fn can_promote(&self, binding: &GateBinding) -> bool {
        binding.sample_count >= self.thresholds.promotion_sample_size
            && binding.confidence >= self.thresholds.confidence_threshold
            && !self.exceeds_violation_ratio(binding)
    }

    #[inline]
    fn exceeds_violation_ratio(&self, binding: &GateBinding) -> bool {
        binding.violation_count as f64 > self.policy.demotion_violation_ratio * binding.sample_count as f64
    }

    fn transition(
        &self,
        binding: &GateBinding,
        at: DateTime<Utc>,
    ) -> Option<(DecisionKind, BindingStatus, Factors)> {
        if binding.is_rejected() {
            return None;
        }

        if binding.violation_count >= self.policy.max_violations {
            let factors = smallvec![Factor::new(
                "violation_count",
                binding.violation_count as f64,
                1.0,
                -1.0,
            )
            .with_detail(format!(
                "{} violations reached the hard limit of {}",
                binding.violation_count, self.policy.max_violations
            ))];
            return Some((DecisionKind::Rejected, BindingStatus::Rejected, factors));
        }

        if let Some(since) = binding.low_confidence_since {
            let low_for = (at - since).num_seconds();
            if low_for >= self.policy.rejection_grace_secs
                && binding.observations() >= self.policy.min_observations
            {
                let factors = smallvec![
                    Factor::new("confidence", binding.confidence, 0.7, -(1.0 - binding.confidence) * 0.7)
                        .with_detail(format!(
                            "confidence {:.2} below {:.2} for {} min",
                            binding.confidence,
                            self.policy.rejection_confidence_floor,
                            low_for / 60
                        )),
                    Factor::new("observations", binding.observations() as f64, 0.3, 0.3),
                ];
                return Some((DecisionKind::Rejected, BindingStatus::Rejected, factors));
            }
        }

        match binding.status {
            BindingStatus::Probation if self.can_promote(binding) => {
                let samples = binding.sample_count as f64;
                let needed = self.thresholds.promotion_sample_size as f64;
                let ratio = binding.violation_ratio();
                let factors = smallvec![
                    Factor::new("confidence", binding.confidence, 0.5, 0.5 * binding.confidence)
                        .with_detail(format!(
                            "confidence {:.2} reached threshold {:.2}",
                            binding.confidence, self.thresholds.confidence_threshold
                        )),
                    Factor::new("sample_count", samples, 0.3, 0.3 * (samples / needed).min(1.0))
                        .with_detail(format!("{samples} consistent scans (needs {needed})")),
                    Factor::new("violation_ratio", ratio, 0.2, -0.2 * ratio),
                ];
                Some((DecisionKind::Promoted, BindingStatus::Enforced, factors))
            }
            BindingStatus::Enforced if self.exceeds_violation_ratio(binding) => {
                let ratio = binding.violation_ratio();
                let limit = self.policy.demotion_violation_ratio;
                // Relative to the limit, so the breach always dominates
                let severity = if limit > 0.0 { (ratio / limit).min(1.0) } else { 1.0 };
                let factors = smallvec![
                    Factor::new("violation_ratio", ratio, 1.0, -severity).with_detail(format!(
                        "{} violations against {} scans ({:.0}% > {:.0}%)",
                        binding.violation_count,
                        binding.sample_count,
                        ratio * 100.0,
                        self.policy.demotion_violation_ratio * 100.0
                    )),
                    Factor::new("confidence", binding.confidence, 0.3, -0.3 * (1.0 - binding.confidence)),
                ];
                Some((DecisionKind::Demoted, BindingStatus::Probation, factors))
            }
            _ => None,
        }
    }
}

/// Bindings of one gate
pub fn gate_bindings<'m>(
    bindings: &'m BindingMap,
    gate: &'m GateId,
) -> impl Iterator<Item = &'m GateBinding> + 'm {
    let start = BindingKey::new(gate.clone(), Category::from(""));
    bindings.range(start..).map(|(_, b)| b).take_while(move |b| &b.gate_id == gate)
}

/// Whether any binding at the gate is enforced
pub fn has_enforced(bindings: &BindingMap, gate: &GateId) -> bool {
    gate_bindings(bindings, gate).any(GateBinding::is_enforced)
}

/// Share of a gate's samples held by one binding
fn category_share(bindings: &BindingMap, gate: &GateId, samples: u64) -> f64 {
    let total: u64 = gate_bindings(bindings, gate).map(|b| b.sample_count).sum();
    if total == 0 {
        1.0
    } else {
        samples as f64 / total as f64
    }
}

fn breakdown(binding: &GateBinding, thresholds: &AdaptiveThresholds, category_share: f64) -> ConfidenceBreakdown {
    let observations = binding.observations().max(1) as f64;
    ConfidenceBreakdown::new(
        binding.sample_count as f64 / observations,
        binding.sample_count as f64 / thresholds.promotion_sample_size.max(1) as f64,
        binding.confidence,
        category_share,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::EventId;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 18, 0, 0).unwrap()
    }

    fn thresholds() -> AdaptiveThresholds {
        AdaptiveThresholds::default()
    }

    fn feed(
        tracker: &BindingTracker<'_>,
        bindings: &mut BindingMap,
        recorder: &mut DecisionRecorder,
        category: &str,
        evidence: Evidence,
        count: usize,
        start: DateTime<Utc>,
    ) {
        let gate = GateId::from("g1");
        for i in 0..count {
            tracker.observe(
                bindings,
                &gate,
                &Category::from(category),
                evidence.clone(),
                start + Duration::seconds(i as i64 * 30),
                recorder,
            );
        }
    }

    fn key(category: &str) -> BindingKey {
        BindingKey::new(GateId::from("g1"), Category::from(category))
    }

    #[test]
    fn test_first_scan_creates_probation_binding() {
        let policy = BindingPolicy::default();
        let t = thresholds();
        let tracker = BindingTracker::new(&policy, &t);
        let mut bindings = BindingMap::new();
        let mut recorder = DecisionRecorder::new(EventId::from("ev"));

        feed(&tracker, &mut bindings, &mut recorder, "GA", tracker.consistent(true), 1, t0());

        let b = &bindings[&key("GA")];
        assert_eq!(b.status, BindingStatus::Probation);
        assert_eq!(b.sample_count, 1);
        assert!((b.confidence - 0.05).abs() < 1e-12);
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.decisions()[0].kind, DecisionKind::Created);
    }

    #[test]
    fn test_promotes_after_enough_consistent_scans() {
        let policy = BindingPolicy::default();
        let t = thresholds();
        let tracker = BindingTracker::new(&policy, &t);
        let mut bindings = BindingMap::new();
        let mut recorder = DecisionRecorder::new(EventId::from("ev"));

        feed(&tracker, &mut bindings, &mut recorder, "GA", tracker.consistent(true), 49, t0());
        assert_eq!(bindings[&key("GA")].status, BindingStatus::Probation);

        feed(&tracker, &mut bindings, &mut recorder, "GA", tracker.consistent(true), 1, t0());
        let b = &bindings[&key("GA")];
        assert_eq!(b.status, BindingStatus::Enforced);
        assert!(b.confidence >= 0.8);
        let promoted: Vec<_> =
            recorder.decisions().iter().filter(|d| d.kind == DecisionKind::Promoted).collect();
        assert_eq!(promoted.len(), 1);
        assert!(promoted[0].primary_reason.contains("confidence"));
    }

    #[test]
    fn test_ambient_evidence_weighs_half() {
        let policy = BindingPolicy::default();
        let t = thresholds();
        let tracker = BindingTracker::new(&policy, &t);
        assert_eq!(tracker.consistent(false), Evidence::Consistent { weight: 0.025 });
    }

    #[test]
    fn test_cross_category_scans_demote_enforced_binding() {
        let policy = BindingPolicy::default();
        let mut t = thresholds();
        t.promotion_sample_size = 30;
        let tracker = BindingTracker::new(&policy, &t);
        let mut bindings = BindingMap::new();
        let mut recorder = DecisionRecorder::new(EventId::from("ev"));

        feed(&tracker, &mut bindings, &mut recorder, "GA", tracker.consistent(true), 40, t0());
        assert_eq!(bindings[&key("GA")].status, BindingStatus::Enforced);

        feed(
            &tracker,
            &mut bindings,
            &mut recorder,
            "VIP",
            tracker.consistent(true),
            15,
            t0() + Duration::hours(1),
        );
        // Once demoted, GA is no longer enforced and stops collecting cross-category violations
        let ga = &bindings[&key("GA")];
        assert_eq!(ga.violation_count, 11);
        assert_eq!(ga.status, BindingStatus::Probation);
        assert_eq!(bindings[&key("VIP")].status, BindingStatus::Probation);

        let demoted: Vec<_> =
            recorder.decisions().iter().filter(|d| d.kind == DecisionKind::Demoted).collect();
        assert_eq!(demoted.len(), 1);
        // 11 > 0.25 * 40
        assert!(demoted[0].primary_reason.starts_with("11 violations against 40 scans"));
    }

    #[test]
    fn test_hard_violation_limit_rejects() {
        let policy = BindingPolicy { max_violations: 5, ..BindingPolicy::default() };
        let t = thresholds();
        let tracker = BindingTracker::new(&policy, &t);
        let mut bindings = BindingMap::new();
        let mut recorder = DecisionRecorder::new(EventId::from("ev"));
        let violation = Evidence::Violation(Violation::Geospatial { distance_m: 30.0 });

        feed(&tracker, &mut bindings, &mut recorder, "GA", violation, 5, t0());
        assert_eq!(bindings[&key("GA")].status, BindingStatus::Rejected);

        // Terminal
        feed(&tracker, &mut bindings, &mut recorder, "GA", tracker.consistent(true), 80, t0());
        let b = &bindings[&key("GA")];
        assert_eq!(b.status, BindingStatus::Rejected);
        assert_eq!(b.sample_count, 0);
    }

    #[test]
    fn test_sustained_low_confidence_rejects_after_grace() {
        let policy = BindingPolicy::default();
        let t = thresholds();
        let tracker = BindingTracker::new(&policy, &t);
        let mut bindings = BindingMap::new();
        let mut recorder = DecisionRecorder::new(EventId::from("ev"));
        let violation = Evidence::Violation(Violation::Temporal { speed_mps: 40.0 });

        // 30 violations 30s apart: 14.5 minutes, still inside the grace period
        feed(&tracker, &mut bindings, &mut recorder, "GA", violation.clone(), 30, t0());
        assert_eq!(bindings[&key("GA")].status, BindingStatus::Probation);

        feed(&tracker, &mut bindings, &mut recorder, "GA", violation, 1, t0() + Duration::minutes(31));
        assert_eq!(bindings[&key("GA")].status, BindingStatus::Rejected);
        let last = recorder.decisions().last().unwrap();
        assert_eq!(last.kind, DecisionKind::Rejected);
        assert!(last.primary_reason.contains("below 0.20"));
    }

    #[test]
    fn test_gate_bindings_scoped_to_gate() {
        let mut bindings = BindingMap::new();
        for (gate, cat) in [("g1", "GA"), ("g1", "VIP"), ("g10", "GA"), ("g2", "GA")] {
            let b = GateBinding::probation(GateId::from(gate), Category::from(cat), t0());
            bindings.insert(b.key(), b);
        }
        let g1 = GateId::from("g1");
        let cats: Vec<&str> = gate_bindings(&bindings, &g1).map(|b| b.category.as_str()).collect();
        assert_eq!(cats, vec!["GA", "VIP"]);
        assert!(!has_enforced(&bindings, &g1));
    }

    proptest! {
        #[test]
        fn prop_confidence_monotone_under_consistent_evidence(weights in proptest::collection::vec(0.0f64..1.0, 1..200)) {
            let policy = BindingPolicy::default();
            let t = thresholds();
            let tracker = BindingTracker::new(&policy, &t);
            let mut binding = GateBinding::probation(GateId::from("g1"), Category::from("GA"), t0());
            let mut previous = binding.confidence;
            for w in weights {
                tracker.apply(&mut binding, &Evidence::Consistent { weight: w }, t0());
                prop_assert!(binding.confidence >= previous);
                prop_assert!(binding.confidence <= 1.0);
                previous = binding.confidence;
            }
        }

        #[test]
        fn prop_promotion_only_when_preconditions_hold(steps in proptest::collection::vec(any::<bool>(), 1..300)) {
            let policy = BindingPolicy::default();
            let mut t = thresholds();
            t.promotion_sample_size = 20;
            let tracker = BindingTracker::new(&policy, &t);
            let mut bindings = BindingMap::new();
            let mut recorder = DecisionRecorder::new(EventId::from("ev"));
            let gate = GateId::from("g1");
            let category = Category::from("GA");

            for (i, consistent) in steps.into_iter().enumerate() {
                let evidence = if consistent {
                    tracker.consistent(true)
                } else {
                    Evidence::Violation(Violation::Geospatial { distance_m: 25.0 })
                };
                let before = bindings.get(&key("GA")).map(|b| b.status);
                tracker.observe(&mut bindings, &gate, &category, evidence, t0() + Duration::seconds(i as i64), &mut recorder);
                let b = &bindings[&key("GA")];
                if before != Some(BindingStatus::Enforced) && b.status == BindingStatus::Enforced {
                    prop_assert!(b.sample_count >= t.promotion_sample_size);
                    prop_assert!(b.confidence >= t.confidence_threshold);
                }
                prop_assert!((0.0..=1.0).contains(&b.confidence));
            }
        }
    }
}
