//! One recompute cycle over an event's check-in snapshot
//!
//! Phases, in order:
//! 1. lifecycle - refresh per-gate window stats and health, archive stale or
//!    unhealthy gates, move gates between learning and active
//! 2. discovery - cluster the window and match candidates to gates
//! 3. evidence - attribute unprocessed check-ins and feed the binding tracker
//! 4. merge - pairwise duplicate detection once every gate is final
//!
//! Cancellation and the deadline are checked between per-gate units of work.
//! Whatever finished before an interruption is kept; the merge phase only runs
//! on a complete cycle.

use crate::domain::decision::{
    ConfidenceBreakdown, DecisionExplanation, DecisionKind, DecisionSubject, Factor,
};
use crate::domain::gate::{ArchiveReason, Gate, GateStatus};
use crate::domain::geo::{self, GeoPoint};
use crate::domain::thresholds::AdaptiveThresholds;
use crate::domain::types::{CheckinEvent, EventId, GateId, WristbandId};
use crate::infra::config::{BindingPolicy, EngineConfig, HealthPolicy, MergePolicy};
use crate::services::binding_tracker::{has_enforced, BindingTracker, Evidence, Violation};
use crate::services::clustering::{self, Cluster, ClusterParams};
use crate::services::decision_recorder::DecisionRecorder;
use crate::services::health::{self, ActivityReport, HourlyWindow};
use crate::services::merge_detector;
use crate::services::state::EventState;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use smallvec::smallvec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Counters of one cycle, derived from its decisions
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Check-ins in the window snapshot
    pub checkins: usize,
    /// Check-ins fed to the binding tracker this cycle
    pub scans_processed: usize,
    pub gates_created: usize,
    pub gates_archived: usize,
    pub bindings_created: usize,
    pub promotions: usize,
    pub demotions: usize,
    pub rejections: usize,
    pub merges_executed: usize,
    pub merges_suggested: usize,
    pub duration_ms: u64,
    pub decisions: Vec<DecisionExplanation>,
}

impl CycleReport {
    fn tally(&mut self) {
        for d in &self.decisions {
            let on_binding = matches!(d.subject, DecisionSubject::Binding { .. });
            match d.kind {
                DecisionKind::Created if on_binding => self.bindings_created += 1,
                DecisionKind::Created => self.gates_created += 1,
                DecisionKind::Promoted if on_binding => self.promotions += 1,
                DecisionKind::Demoted if on_binding => self.demotions += 1,
                DecisionKind::Rejected => self.rejections += 1,
                DecisionKind::Archived => self.gates_archived += 1,
                DecisionKind::Merged => self.merges_executed += 1,
                DecisionKind::MergeSuggested => self.merges_suggested += 1,
                _ => {}
            }
        }
    }
}

/// Why a cycle stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Policies a cycle runs under
#[derive(Debug, Clone, Copy)]
pub struct CyclePolicies<'a> {
    pub engine: &'a EngineConfig,
    pub binding: &'a BindingPolicy,
    pub merge: &'a MergePolicy,
    pub health: &'a HealthPolicy,
}

pub struct CycleResult {
    /// None when the window was too thin to do anything
    pub state: Option<EventState>,
    pub report: CycleReport,
    pub interrupted: Option<Interrupt>,
}

pub struct RecomputeCycle<'a> {
    policies: CyclePolicies<'a>,
    thresholds: AdaptiveThresholds,
    cancel: &'a AtomicBool,
    deadline: Instant,
    now: DateTime<Utc>,
    window: HourlyWindow,
}

impl<'a> RecomputeCycle<'a> {
    pub fn new(
        policies: CyclePolicies<'a>,
        thresholds: AdaptiveThresholds,
        cancel: &'a AtomicBool,
        deadline: Instant,
        now: DateTime<Utc>,
    ) -> Self {
        let hours = policies.engine.learning_window_hours;
        let start = now - Duration::hours(hours as i64);
        Self { policies, thresholds, cancel, deadline, now, window: HourlyWindow::new(start, hours) }
    }

    fn interrupted(&self) -> Option<Interrupt> {
        if self.cancel.load(Ordering::Acquire) {
            Some(Interrupt::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(Interrupt::TimedOut)
        } else {
            None
        }
    }

    fn cluster_params(&self) -> ClusterParams {
        ClusterParams {
            eps_m: self.thresholds.duplicate_distance_meters,
            min_samples: self.thresholds.min_cluster_samples,
            max_accuracy_m: self.policies.engine.max_location_accuracy_m,
        }
    }

    /// Window snapshot of the event: in range, sorted by (timestamp, id)
    fn snapshot(&self, event_id: &EventId, checkins: &[CheckinEvent]) -> Vec<CheckinEvent> {
        let mut window: Vec<CheckinEvent> = checkins
            .iter()
            .filter(|c| &c.event_id == event_id)
            .filter(|c| c.timestamp >= self.window.start && c.timestamp <= self.now)
            .cloned()
            .collect();
        window.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        window
    }

    pub fn run(self, mut state: EventState, checkins: &[CheckinEvent]) -> CycleResult {
        let started = Instant::now();
        let snapshot = self.snapshot(&state.event_id, checkins);
        let mut report = CycleReport { checkins: snapshot.len(), ..Default::default() };

        if snapshot.len() < self.thresholds.min_cluster_samples {
            debug!(
                event_id = %state.event_id,
                checkins = %snapshot.len(),
                min = %self.thresholds.min_cluster_samples,
                "cycle_window_too_thin"
            );
            report.duration_ms = started.elapsed().as_millis() as u64;
            return CycleResult { state: None, report, interrupted: None };
        }

        state.cycles += 1;
        let pruned = state.prune_attributions(self.window.start);
        if pruned > 0 {
            debug!(event_id = %state.event_id, pruned = %pruned, "attributions_pruned");
        }

        let mut recorder = DecisionRecorder::new(state.event_id.clone());
        let tracker = BindingTracker::new(self.policies.binding, &self.thresholds);

        let interrupted = match self.phases(&mut state, &snapshot, &tracker, &mut recorder) {
            Ok(processed) => {
                report.scans_processed = processed;
                None
            }
            Err(interrupt) => Some(interrupt),
        };

        if interrupted.is_none() {
            let mut activity = self.activity(&state, &snapshot);
            merge_detector::run(
                &mut state,
                &mut activity,
                &self.thresholds,
                self.policies.merge,
                &tracker,
                &mut recorder,
                self.now,
            );
            let activity = self.activity(&state, &snapshot);
            for gate in state.gates.iter_mut().filter(|g| g.is_live()) {
                gate.window_sample_count = activity.scans(&gate.id);
            }
        }

        report.decisions = recorder.into_decisions();
        report.tally();
        report.duration_ms = started.elapsed().as_millis() as u64;

        match interrupted {
            Some(reason) => warn!(
                event_id = %state.event_id,
                reason = ?reason,
                decisions = %report.decisions.len(),
                "cycle_interrupted"
            ),
            None => info!(
                event_id = %state.event_id,
                checkins = %report.checkins,
                processed = %report.scans_processed,
                gates_created = %report.gates_created,
                promotions = %report.promotions,
                merges = %report.merges_executed,
                duration_ms = %report.duration_ms,
                "cycle_completed"
            ),
        }

        CycleResult { state: Some(state), report, interrupted }
    }

    fn phases(
        &self,
        state: &mut EventState,
        snapshot: &[CheckinEvent],
        tracker: &BindingTracker<'_>,
        recorder: &mut DecisionRecorder,
    ) -> Result<usize, Interrupt> {
        self.lifecycle(state, snapshot, recorder)?;
        let clustering = clustering::discover(snapshot, &self.cluster_params());
        let cluster_gates = self.discover(state, &clustering.clusters, recorder)?;
        self.evidence(state, snapshot, &clustering, &cluster_gates, tracker, recorder)
    }

    fn activity(&self, state: &EventState, snapshot: &[CheckinEvent]) -> ActivityReport {
        health::collect(snapshot, self.window, |c| state.gate_of(&c.id))
    }

    /// Phase 1: per-gate stats, archival, learning/active moves
    fn lifecycle(
        &self,
        state: &mut EventState,
        snapshot: &[CheckinEvent],
        recorder: &mut DecisionRecorder,
    ) -> Result<(), Interrupt> {
        let activity = self.activity(state, snapshot);

        for idx in 0..state.gates.len() {
            if let Some(interrupt) = self.interrupted() {
                return Err(interrupt);
            }
            if state.gates[idx].is_archived() {
                continue;
            }
            let enforced = has_enforced(&state.bindings, &state.gates[idx].id);
            let gate = &mut state.gates[idx];

            let scans = activity.scans(&gate.id);
            gate.window_sample_count = scans;
            if scans == 0 {
                gate.idle_cycles += 1;
            } else {
                gate.idle_cycles = 0;
                if let Some(health) = activity
                    .get(&gate.id)
                    .and_then(|a| health::score(a, &activity, self.policies.health))
                {
                    gate.health = health;
                }
            }

            if gate.idle_cycles >= self.policies.engine.stale_cycles_before_archive {
                let idle = gate.idle_cycles;
                gate.archive(ArchiveReason::Stale { idle_cycles: idle }, self.now);
                recorder.gate(
                    DecisionKind::Archived,
                    &gate.id,
                    smallvec![Factor::new("idle_cycles", idle as f64, 1.0, 1.0)
                        .with_detail(format!("no scans for {idle} consecutive cycles"))],
                    gate_breakdown(gate, &self.thresholds),
                    self.now,
                );
                continue;
            }

            let min_samples = self.thresholds.min_cluster_samples as u64;
            if scans >= min_samples && gate.health.score < self.policies.health.archive_floor {
                let health = gate.health;
                gate.archive(ArchiveReason::Unhealthy { health_score: health.score }, self.now);
                recorder.gate(
                    DecisionKind::Archived,
                    &gate.id,
                    smallvec![
                        Factor::new("health_score", health.score, 1.0, 1.0 - health.score).with_detail(
                            format!(
                                "health {:.2} below floor {:.2}",
                                health.score, self.policies.health.archive_floor
                            )
                        ),
                        Factor::new("success_rate", health.success_rate, 0.5, 0.5 * (1.0 - health.success_rate)),
                        Factor::new("uptime", health.uptime, 0.25, 0.25 * (1.0 - health.uptime)),
                    ],
                    gate_breakdown(gate, &self.thresholds),
                    self.now,
                );
                continue;
            }

            match gate.status {
                GateStatus::Learning if enforced => {
                    gate.status = GateStatus::Active;
                    gate.updated_at = self.now;
                    recorder.gate(
                        DecisionKind::Promoted,
                        &gate.id,
                        smallvec![Factor::new("enforced_bindings", 1.0, 1.0, 1.0)
                            .with_detail("gate has an enforced category binding")],
                        gate_breakdown(gate, &self.thresholds),
                        self.now,
                    );
                }
                GateStatus::Active if !enforced => {
                    gate.status = GateStatus::Learning;
                    gate.updated_at = self.now;
                    recorder.gate(
                        DecisionKind::Demoted,
                        &gate.id,
                        smallvec![Factor::new("enforced_bindings", 0.0, 1.0, -1.0)
                            .with_detail("gate no longer has an enforced category binding")],
                        gate_breakdown(gate, &self.thresholds),
                        self.now,
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Phase 2: map each cluster to an existing live gate or a new one
    fn discover(
        &self,
        state: &mut EventState,
        clusters: &[Cluster],
        recorder: &mut DecisionRecorder,
    ) -> Result<Vec<GateId>, Interrupt> {
        let eps = self.thresholds.duplicate_distance_meters;
        let mut cluster_gates = Vec::with_capacity(clusters.len());
        let mut updates: BTreeMap<GateId, Vec<&Cluster>> = BTreeMap::new();

        for cluster in clusters {
            if let Some(interrupt) = self.interrupted() {
                return Err(interrupt);
            }
            if let Some(existing) = nearest_live_gate(state, cluster.centroid, eps) {
                updates.entry(existing.clone()).or_default().push(cluster);
                cluster_gates.push(existing);
                continue;
            }

            state.gates_discovered += 1;
            let gate = Gate::discovered(
                state.event_id.clone(),
                state.gates_discovered,
                &cluster.dominant_category,
                cluster.centroid,
                cluster.spatial_variance,
                cluster.confidence,
                self.now,
            );
            let min_samples = self.thresholds.min_cluster_samples.max(1);
            let sample_score = (cluster.sample_count() as f64 / (3 * min_samples) as f64).min(1.0);
            let tightness = 1.0 / (1.0 + cluster.spatial_variance / (eps * eps));
            recorder.gate(
                DecisionKind::Created,
                &gate.id,
                smallvec![
                    Factor::new("spatial_variance", cluster.spatial_variance, 0.4, 0.4 * tightness).with_detail(
                        format!(
                            "{} scans within {:.1}m RMS of the centroid",
                            cluster.sample_count(),
                            cluster.spatial_variance.sqrt()
                        )
                    ),
                    Factor::new("sample_count", cluster.sample_count() as f64, 0.3, 0.3 * sample_score),
                    Factor::new("category_purity", cluster.purity, 0.3, 0.3 * cluster.purity).with_detail(
                        format!("{:.0}% {} scans", cluster.purity * 100.0, cluster.dominant_category)
                    ),
                ],
                ConfidenceBreakdown::new(tightness, sample_score, 0.5, cluster.purity),
                self.now,
            );
            info!(
                event_id = %state.event_id,
                gate_id = %gate.id,
                name = %gate.name,
                samples = %cluster.sample_count(),
                confidence = format!("{:.3}", cluster.confidence),
                "gate_discovered"
            );
            cluster_gates.push(gate.id.clone());
            state.gates.push(gate);
        }

        for (gate_id, matched) in updates {
            if let Some(gate) = state.gate_mut(&gate_id) {
                refresh_spatial(gate, &matched, self.now);
                debug!(
                    gate_id = %gate.id,
                    clusters = %matched.len(),
                    variance = format!("{:.1}", gate.spatial_variance),
                    "gate_spatial_refreshed"
                );
            }
        }
        Ok(cluster_gates)
    }

    /// Phase 3: attribute unprocessed check-ins and apply evidence per gate
    fn evidence(
        &self,
        state: &mut EventState,
        snapshot: &[CheckinEvent],
        clustering: &clustering::Clustering,
        cluster_gates: &[GateId],
        tracker: &BindingTracker<'_>,
        recorder: &mut DecisionRecorder,
    ) -> Result<usize, Interrupt> {
        let eps = self.thresholds.duplicate_distance_meters;
        let max_acc = self.policies.engine.max_location_accuracy_m;

        // Located scans per wristband in time order, for the velocity check
        let mut tracks: FxHashMap<&WristbandId, Vec<(DateTime<Utc>, GeoPoint)>> = FxHashMap::default();
        for c in snapshot {
            if let Some(p) = c.usable_point(max_acc) {
                tracks.entry(&c.wristband_id).or_default().push((c.timestamp, p));
            }
        }

        let mut per_gate: BTreeMap<GateId, Vec<(usize, Evidence)>> = BTreeMap::new();
        for (idx, checkin) in snapshot.iter().enumerate() {
            if state.is_processed(&checkin.id) {
                continue;
            }
            let point = checkin.usable_point(max_acc);
            let assigned = clustering.cluster_of(idx).and_then(|c| cluster_gates.get(c)).cloned();

            let (gate, mut evidence) = match (assigned, point) {
                (Some(gate), _) => (gate, tracker.consistent(point.is_some())),
                (None, Some(p)) => match nearest_live_gate_with_distance(state, p, 2.0 * eps) {
                    Some((gate, d)) if d <= eps => (gate, tracker.consistent(true)),
                    Some((gate, d)) => (gate, Evidence::Violation(Violation::Geospatial { distance_m: d })),
                    None => continue,
                },
                (None, None) => continue,
            };

            if let (Evidence::Consistent { .. }, Some(p)) = (&evidence, point) {
                if let Some(speed) = implied_speed(&tracks, checkin, p, eps) {
                    if speed > self.thresholds.velocity_threshold {
                        evidence = Evidence::Violation(Violation::Temporal { speed_mps: speed });
                    }
                }
            }
            per_gate.entry(gate).or_default().push((idx, evidence));
        }

        let mut processed = 0usize;
        for (gate_id, items) in per_gate {
            if let Some(interrupt) = self.interrupted() {
                return Err(interrupt);
            }
            for (idx, evidence) in &items {
                let checkin = &snapshot[*idx];
                tracker.observe(
                    &mut state.bindings,
                    &gate_id,
                    &checkin.category,
                    evidence.clone(),
                    checkin.timestamp,
                    recorder,
                );
                state.attribute(checkin.id.clone(), gate_id.clone(), checkin.timestamp);
            }
            if let Some(gate) = state.gate_mut(&gate_id) {
                gate.sample_count += items.len() as u64;
                gate.updated_at = self.now;
            }
            processed += items.len();
        }
        Ok(processed)
    }
}

/// Nearest live gate with its centroid within `radius_m`; ties go to the
/// outranking gate
fn nearest_live_gate_with_distance(state: &EventState, point: GeoPoint, radius_m: f64) -> Option<(GateId, f64)> {
    let mut best: Option<(&Gate, f64)> = None;
    for gate in state.live_gates() {
        let d = geo::distance_m(point, gate.centroid);
        if d > radius_m {
            continue;
        }
        best = match best {
            Some((b, bd)) if bd < d || (bd == d && b.outranks(gate)) => Some((b, bd)),
            _ => Some((gate, d)),
        };
    }
    best.map(|(g, d)| (g.id.clone(), d))
}

fn nearest_live_gate(state: &EventState, point: GeoPoint, radius_m: f64) -> Option<GateId> {
    nearest_live_gate_with_distance(state, point, radius_m).map(|(g, _)| g)
}

/// Speed from the wristband's previous located scan, when it moved more than
/// epsilon
fn implied_speed(
    tracks: &FxHashMap<&WristbandId, Vec<(DateTime<Utc>, GeoPoint)>>,
    checkin: &CheckinEvent,
    point: GeoPoint,
    eps_m: f64,
) -> Option<f64> {
    let track = tracks.get(&checkin.wristband_id)?;
    let (prev_at, prev_point) = track.iter().rev().find(|(at, _)| *at < checkin.timestamp)?;
    let moved = geo::distance_m(*prev_point, point);
    if moved <= eps_m {
        return None;
    }
    let secs = (checkin.timestamp - *prev_at).num_milliseconds() as f64 / 1000.0;
    Some(if secs > 0.0 { moved / secs } else { f64::INFINITY })
}

/// Replace a gate's spatial statistics with those of its matched clusters
fn refresh_spatial(gate: &mut Gate, clusters: &[&Cluster], now: DateTime<Utc>) {
    let total: usize = clusters.iter().map(|c| c.members.len()).sum();
    if total == 0 {
        return;
    }
    let mut centroid = clusters[0].centroid;
    let mut weight = clusters[0].members.len() as f64;
    for c in &clusters[1..] {
        let w = c.members.len() as f64;
        centroid = geo::weighted_midpoint(centroid, weight, c.centroid, w);
        weight += w;
    }
    let variance = clusters
        .iter()
        .map(|c| {
            let d = geo::distance_m(c.centroid, centroid);
            c.members.len() as f64 * (c.spatial_variance + d * d)
        })
        .sum::<f64>()
        / total as f64;

    gate.centroid = centroid;
    gate.spatial_variance = variance;
    gate.discovery_confidence = clusters.iter().map(|c| c.confidence).fold(0.0, f64::max);
    gate.updated_at = now;
}

fn gate_breakdown(gate: &Gate, thresholds: &AdaptiveThresholds) -> ConfidenceBreakdown {
    let eps = thresholds.duplicate_distance_meters;
    ConfidenceBreakdown::new(
        1.0 / (1.0 + gate.spatial_variance / (eps * eps)),
        gate.window_sample_count as f64 / thresholds.min_cluster_samples.max(1) as f64,
        gate.health.uptime,
        gate.discovery_confidence,
    )
}
