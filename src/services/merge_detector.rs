//! Duplicate gate detection and merge execution
//!
//! Pairs of live gates are prefiltered on a grid with cell = epsilon, then
//! scored on centroid distance and hourly traffic similarity. High-confidence
//! pairs merge immediately; the rest wait as pending suggestions.

use crate::domain::binding::{BindingKey, GateBinding};
use crate::domain::decision::{ConfidenceBreakdown, DecisionKind, DecisionSubject, Factor};
use crate::domain::gate::{ArchiveReason, Gate};
use crate::domain::geo::{self, GeoPoint, GridIndex};
use crate::domain::merge::{MergeOrigin, MergeStatus, MergeSuggestion};
use crate::domain::thresholds::AdaptiveThresholds;
use crate::domain::types::GateId;
use crate::infra::config::MergePolicy;
use crate::services::binding_tracker::{gate_bindings, BindingTracker};
use crate::services::decision_recorder::{DecisionRecorder, Factors};
use crate::services::health::{self, ActivityReport};
use crate::services::state::EventState;
use chrono::{DateTime, Utc};
use smallvec::smallvec;
use tracing::{debug, info};

const PROXIMITY_WEIGHT: f64 = 0.4;
const SIMILARITY_WEIGHT: f64 = 0.4;
const EVIDENCE_WEIGHT: f64 = 0.2;

/// A scored duplicate pair
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    pub primary: GateId,
    pub secondary: GateId,
    pub distance_m: f64,
    pub similarity: f64,
    pub confidence: f64,
    /// min(sample_count) of the pair
    pub min_samples: u64,
    /// Jaccard overlap of bound categories
    pub category_overlap: f64,
}

impl MergeCandidate {
    fn reasoning(&self, eps_m: f64) -> String {
        format!(
            "centroids {:.1}m apart (< {:.0}m) with hourly traffic similarity {:.2}",
            self.distance_m, eps_m, self.similarity
        )
    }
}

/// Outcome counts of one merge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergePass {
    pub executed: usize,
    pub suggested: usize,
    /// Pending suggestions closed because a gate of the pair was archived
    pub expired: usize,
}

/// Merge confidence in [0, 1]
pub fn merge_confidence(
    distance_m: f64,
    eps_m: f64,
    similarity: f64,
    min_samples: u64,
    min_cluster_samples: usize,
) -> f64 {
    let proximity = 1.0 - (distance_m / eps_m).powi(2).min(1.0);
    let evidence = (min_samples as f64 / (2 * min_cluster_samples.max(1)) as f64).min(1.0);
    (PROXIMITY_WEIGHT * proximity + SIMILARITY_WEIGHT * similarity + EVIDENCE_WEIGHT * evidence)
        .clamp(0.0, 1.0)
}

/// Score every eligible pair, strongest first
pub fn find_candidates(
    state: &EventState,
    activity: &ActivityReport,
    thresholds: &AdaptiveThresholds,
    policy: &MergePolicy,
) -> Vec<MergeCandidate> {
    let eps = thresholds.duplicate_distance_meters;
    let live: Vec<&Gate> = state.live_gates().collect();
    let centroids: Vec<GeoPoint> = live.iter().map(|g| g.centroid).collect();
    let Some(grid) = GridIndex::from_points(&centroids, eps) else {
        return Vec::new();
    };

    let empty = vec![0u32; activity.window.bins];

    let mut candidates = Vec::new();
    for (i, a) in live.iter().enumerate() {
        for j in grid.candidates(a.centroid) {
            if j <= i {
                continue;
            }
            let b = live[j];
            let distance_m = geo::distance_m(a.centroid, b.centroid);
            if distance_m >= eps {
                continue;
            }
            if state.has_open_or_rejected(&a.id, &b.id) {
                continue;
            }
            let similarity = health::traffic_similarity(
                hourly(activity, &empty, &a.id),
                hourly(activity, &empty, &b.id),
            );
            if similarity < policy.similarity_floor {
                debug!(gate_a = %a.id, gate_b = %b.id, similarity = %similarity, "merge_pair_dissimilar");
                continue;
            }
            let min_samples = a.sample_count.min(b.sample_count);
            let confidence =
                merge_confidence(distance_m, eps, similarity, min_samples, thresholds.min_cluster_samples);
            let (primary, secondary) = if a.outranks(b) { (*a, b) } else { (b, *a) };
            candidates.push(MergeCandidate {
                primary: primary.id.clone(),
                secondary: secondary.id.clone(),
                distance_m,
                similarity,
                confidence,
                min_samples,
                category_overlap: category_overlap(state, &a.id, &b.id),
            });
        }
    }

    candidates.sort_by(|x, y| {
        y.confidence
            .total_cmp(&x.confidence)
            .then_with(|| x.primary.cmp(&y.primary))
            .then_with(|| x.secondary.cmp(&y.secondary))
    });
    candidates
}

fn hourly<'r>(activity: &'r ActivityReport, empty: &'r [u32], gate: &GateId) -> &'r [u32] {
    activity.get(gate).map_or(empty, |a| a.hourly.as_slice())
}

/// Detect duplicates among live gates; auto-merge or persist suggestions
#[allow(clippy::too_many_arguments)]
pub fn run(
    state: &mut EventState,
    activity: &mut ActivityReport,
    thresholds: &AdaptiveThresholds,
    policy: &MergePolicy,
    tracker: &BindingTracker<'_>,
    recorder: &mut DecisionRecorder,
    at: DateTime<Utc>,
) -> MergePass {
    let mut pass = MergePass::default();
    let eps = thresholds.duplicate_distance_meters;

    for candidate in find_candidates(state, activity, thresholds, policy) {
        // An earlier merge in this pass may have archived one side
        let both_live = [&candidate.primary, &candidate.secondary]
            .iter()
            .all(|id| state.gate(id).is_some_and(Gate::is_live));
        if !both_live || state.has_open_or_rejected(&candidate.primary, &candidate.secondary) {
            continue;
        }

        let mut suggestion = MergeSuggestion::new(
            candidate.primary.clone(),
            candidate.secondary.clone(),
            candidate.confidence,
            candidate.distance_m,
            candidate.similarity,
            candidate.reasoning(eps),
            at,
        );

        if candidate.confidence >= policy.auto_approve_confidence {
            execute(state, &candidate, thresholds, tracker, recorder, at);
            if let Some(absorbed) = activity.gates.remove(&candidate.secondary) {
                activity
                    .gates
                    .entry(candidate.primary.clone())
                    .or_insert_with(|| health::GateActivity::new(activity.window.bins))
                    .absorb(&absorbed);
            }
            suggestion.resolve(MergeStatus::Approved, MergeOrigin::AutoApproved, at);
            pass.executed += 1;
        } else {
            recorder.record(
                DecisionKind::MergeSuggested,
                DecisionSubject::Merge {
                    primary: candidate.primary.clone(),
                    secondary: candidate.secondary.clone(),
                },
                factors(&candidate, eps, thresholds.min_cluster_samples),
                breakdown(&candidate, eps, thresholds.min_cluster_samples),
                at,
            );
            info!(
                primary = %candidate.primary,
                secondary = %candidate.secondary,
                confidence = format!("{:.3}", candidate.confidence),
                "merge_suggested"
            );
            pass.suggested += 1;
        }
        state.merges.push(suggestion);
    }

    pass.expired = state.expire_stale_merges(at);
    if pass.expired > 0 {
        info!(expired = %pass.expired, "merge_suggestions_expired");
    }
    pass
}

/// Absorb the secondary gate into the primary and record the merge
pub fn execute(
    state: &mut EventState,
    candidate: &MergeCandidate,
    thresholds: &AdaptiveThresholds,
    tracker: &BindingTracker<'_>,
    recorder: &mut DecisionRecorder,
    at: DateTime<Utc>,
) {
    let Some(secondary) = state.gate(&candidate.secondary).cloned() else {
        return;
    };
    let folded = fold_bindings(state, &candidate.primary, &candidate.secondary, at);
    let redirected = state.redirect(&candidate.secondary, &candidate.primary);

    if let Some(primary) = state.gate_mut(&candidate.primary) {
        pool_into(primary, &secondary, at);
    }
    if let Some(gate) = state.gate_mut(&candidate.secondary) {
        gate.archive(ArchiveReason::MergedInto { primary: candidate.primary.clone() }, at);
    }

    let eps = thresholds.duplicate_distance_meters;
    let mut merge_factors = factors(candidate, eps, thresholds.min_cluster_samples);
    merge_factors.push(
        Factor::new("bindings_folded", folded as f64, 0.0, 0.0)
            .with_detail(format!("{folded} bindings and {redirected} check-ins reattributed")),
    );
    recorder.record(
        DecisionKind::Merged,
        DecisionSubject::Merge { primary: candidate.primary.clone(), secondary: candidate.secondary.clone() },
        merge_factors,
        breakdown(candidate, eps, thresholds.min_cluster_samples),
        at,
    );
    info!(
        primary = %candidate.primary,
        secondary = %candidate.secondary,
        confidence = format!("{:.3}", candidate.confidence),
        bindings = %folded,
        checkins = %redirected,
        "gates_merged"
    );

    // Combined evidence may now cross a transition boundary
    let keys: Vec<BindingKey> =
        gate_bindings(&state.bindings, &candidate.primary).map(GateBinding::key).collect();
    for key in keys {
        tracker.evaluate(&mut state.bindings, &key, at, recorder);
    }
}

/// Rebuild a candidate from a stored suggestion for manual approval
pub fn candidate_from(state: &EventState, suggestion: &MergeSuggestion) -> Option<MergeCandidate> {
    let primary = state.gate(&suggestion.primary_gate)?;
    let secondary = state.gate(&suggestion.secondary_gate)?;
    Some(MergeCandidate {
        primary: primary.id.clone(),
        secondary: secondary.id.clone(),
        distance_m: suggestion.distance_meters,
        similarity: suggestion.traffic_similarity,
        confidence: suggestion.confidence_score,
        min_samples: primary.sample_count.min(secondary.sample_count),
        category_overlap: category_overlap(state, &primary.id, &secondary.id),
    })
}

/// Jaccard overlap of the categories bound at two gates
fn category_overlap(state: &EventState, a: &GateId, b: &GateId) -> f64 {
    let cats_a: Vec<_> = gate_bindings(&state.bindings, a).map(|x| &x.category).collect();
    let cats_b: Vec<_> = gate_bindings(&state.bindings, b).map(|x| &x.category).collect();
    let shared = cats_a.iter().filter(|c| cats_b.contains(*c)).count();
    let union = cats_a.len() + cats_b.len() - shared;
    if union == 0 {
        1.0
    } else {
        shared as f64 / union as f64
    }
}

/// Move the secondary's bindings onto the primary, combining shared categories
fn fold_bindings(state: &mut EventState, primary: &GateId, secondary: &GateId, at: DateTime<Utc>) -> usize {
    let keys: Vec<BindingKey> = gate_bindings(&state.bindings, secondary).map(GateBinding::key).collect();
    let mut folded = 0;
    for key in keys {
        let Some(mut moved) = state.bindings.remove(&key) else {
            continue;
        };
        folded += 1;
        let target = BindingKey::new(primary.clone(), key.category.clone());
        match state.bindings.get_mut(&target) {
            Some(existing) => combine(existing, &moved, at),
            None => {
                moved.gate_id = primary.clone();
                moved.updated_at = at;
                state.bindings.insert(target, moved);
            }
        }
    }
    folded
}

/// Sum counters and sample-weight the confidence; the primary keeps its status
fn combine(into: &mut GateBinding, other: &GateBinding, at: DateTime<Utc>) {
    let total = into.sample_count + other.sample_count;
    into.confidence = if total > 0 {
        (into.confidence * into.sample_count as f64 + other.confidence * other.sample_count as f64)
            / total as f64
    } else {
        into.confidence.max(other.confidence)
    };
    into.sample_count = total;
    into.violation_count += other.violation_count;
    into.bound_at = into.bound_at.min(other.bound_at);
    into.last_violation_at = into.last_violation_at.max(other.last_violation_at);
    into.low_confidence_since = match (into.low_confidence_since, other.low_confidence_since) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    into.updated_at = at;
}

/// Pool centroid, variance and counters of two gates
fn pool_into(primary: &mut Gate, secondary: &Gate, at: DateTime<Utc>) {
    let (na, nb) = (primary.sample_count.max(1) as f64, secondary.sample_count.max(1) as f64);
    let pooled = geo::weighted_midpoint(primary.centroid, na, secondary.centroid, nb);
    let da = geo::distance_m(primary.centroid, pooled);
    let db = geo::distance_m(secondary.centroid, pooled);
    primary.spatial_variance = (na * (primary.spatial_variance + da * da)
        + nb * (secondary.spatial_variance + db * db))
        / (na + nb);
    primary.centroid = pooled;
    primary.sample_count += secondary.sample_count;
    primary.window_sample_count += secondary.window_sample_count;
    primary.discovery_confidence = primary.discovery_confidence.max(secondary.discovery_confidence);
    primary.idle_cycles = primary.idle_cycles.min(secondary.idle_cycles);
    primary.updated_at = at;
}

fn factors(candidate: &MergeCandidate, eps_m: f64, min_cluster_samples: usize) -> Factors {
    let proximity = 1.0 - (candidate.distance_m / eps_m).powi(2).min(1.0);
    let evidence = (candidate.min_samples as f64 / (2 * min_cluster_samples.max(1)) as f64).min(1.0);
    smallvec![
        Factor::new("distance_m", candidate.distance_m, PROXIMITY_WEIGHT, PROXIMITY_WEIGHT * proximity)
            .with_detail(format!("centroids {:.1}m apart", candidate.distance_m)),
        Factor::new("traffic_similarity", candidate.similarity, SIMILARITY_WEIGHT, SIMILARITY_WEIGHT * candidate.similarity)
            .with_detail(format!("hourly traffic similarity {:.2}", candidate.similarity)),
        Factor::new("min_samples", candidate.min_samples as f64, EVIDENCE_WEIGHT, EVIDENCE_WEIGHT * evidence)
            .with_detail(format!("both gates have at least {} scans", candidate.min_samples)),
    ]
}

fn breakdown(candidate: &MergeCandidate, eps_m: f64, min_cluster_samples: usize) -> ConfidenceBreakdown {
    ConfidenceBreakdown::new(
        1.0 - (candidate.distance_m / eps_m).powi(2).min(1.0),
        candidate.min_samples as f64 / (2 * min_cluster_samples.max(1)) as f64,
        candidate.similarity,
        candidate.category_overlap,
    )
}
