//! Gate engine: per-event state plus the recompute and optimize entry points
//!
//! Each event owns its gates, bindings, merge suggestions, decisions and
//! thresholds behind its own locks, so events never block each other. A
//! recompute works on a copy of the event state and swaps it in when done;
//! readers always see the last committed cycle.

use crate::domain::binding::{BindingKey, BindingStatus, GateBinding};
use crate::domain::decision::{
    ConfidenceBreakdown, DecisionExplanation, DecisionKind, DecisionQuery, DecisionSubject, Factor,
};
use crate::domain::gate::Gate;
use crate::domain::geo::{GeoError, GeoPoint};
use crate::domain::merge::{MergeOrigin, MergeStatus, MergeSuggestion};
use crate::domain::thresholds::{AdaptiveThresholds, OptimizationEntry, ThresholdError};
use crate::domain::types::{Category, CheckinEvent, EventId, GateId};
use crate::infra::config::{BindingPolicy, Config, EngineConfig, HealthPolicy, MergePolicy, OptimizerPolicy};
use crate::infra::metrics::CycleKind;
use crate::services::binding_tracker::BindingTracker;
use crate::services::cycle::{CyclePolicies, Interrupt, RecomputeCycle};
use crate::services::decision_recorder::DecisionRecorder;
use crate::services::merge_detector;
use crate::services::optimizer::{Optimization, ThresholdOptimizer};
use crate::services::state::EventState;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::smallvec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use crate::services::cycle::CycleReport;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown event {0}")]
    UnknownEvent(EventId),
    #[error("no merge suggestion {id} for event {event}")]
    UnknownSuggestion { event: EventId, id: String },
    #[error("merge suggestion {0} is already resolved")]
    SuggestionResolved(String),
    #[error("merge suggestion {0} refers to a gate that is no longer live")]
    SuggestionStale(String),
    #[error("a recompute cycle is running for event {0}")]
    CycleInProgress(EventId),
    #[error("invalid thresholds: {0}")]
    Thresholds(#[from] ThresholdError),
    #[error("invalid location: {0}")]
    Location(#[from] GeoError),
}

/// Policies the engine runs every event under
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub engine: EngineConfig,
    pub binding: BindingPolicy,
    pub merge: MergePolicy,
    pub optimizer: OptimizerPolicy,
    pub health: HealthPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            engine: config.engine().clone(),
            binding: config.binding_policy().clone(),
            merge: config.merge_policy().clone(),
            optimizer: config.optimizer_policy().clone(),
            health: config.health_policy().clone(),
        }
    }

    pub fn learning_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.engine.learning_window_hours as i64)
    }

    pub fn cycle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.engine.cycle_timeout_secs.max(1))
    }

    fn policies(&self) -> CyclePolicies<'_> {
        CyclePolicies { engine: &self.engine, binding: &self.binding, merge: &self.merge, health: &self.health }
    }
}

/// Result of a recompute request
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Too few check-ins in the window; nothing changed
    NoOp(CycleReport),
    /// Another cycle held the event lock
    Skipped,
    /// Stopped on request; work done before the stop is kept
    Cancelled(CycleReport),
    /// Stopped at the deadline; work done before it is kept
    TimedOut(CycleReport),
}

impl CycleOutcome {
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Completed(r)
            | CycleOutcome::NoOp(r)
            | CycleOutcome::Cancelled(r)
            | CycleOutcome::TimedOut(r) => Some(r),
            CycleOutcome::Skipped => None,
        }
    }

    /// Metrics bucket; None for a skipped cycle
    pub fn kind(&self) -> Option<CycleKind> {
        match self {
            CycleOutcome::Completed(_) => Some(CycleKind::Completed),
            CycleOutcome::NoOp(_) => Some(CycleKind::NoOp),
            CycleOutcome::Cancelled(_) => Some(CycleKind::Cancelled),
            CycleOutcome::TimedOut(_) => Some(CycleKind::TimedOut),
            CycleOutcome::Skipped => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Completed(_) => "completed",
            CycleOutcome::NoOp(_) => "noop",
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::Cancelled(_) => "cancelled",
            CycleOutcome::TimedOut(_) => "timed_out",
        }
    }

    pub fn decisions(&self) -> &[DecisionExplanation] {
        match self.report() {
            Some(report) => report.decisions.as_slice(),
            None => &[],
        }
    }
}

/// Result of an optimization request
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizeOutcome {
    /// Another optimization held the event's optimize lock
    Skipped,
    InsufficientData { promotions: usize },
    Evaluated { accuracy: f64, entries: Vec<OptimizationEntry>, decisions: Vec<DecisionExplanation> },
    /// Thresholds were replaced while the evaluation ran; its result is dropped
    Superseded,
}

impl OptimizeOutcome {
    pub fn decisions(&self) -> &[DecisionExplanation] {
        match self {
            OptimizeOutcome::Evaluated { decisions, .. } => decisions.as_slice(),
            _ => &[],
        }
    }
}

struct EventHandle {
    state: RwLock<EventState>,
    thresholds: RwLock<AdaptiveThresholds>,
    decisions: RwLock<Vec<DecisionExplanation>>,
    /// Held for a cycle or a manual edit; a second taker skips instead of waiting
    recompute_lock: Mutex<()>,
    optimize_lock: Mutex<()>,
    cancel: AtomicBool,
}

impl EventHandle {
    fn new(event_id: EventId, thresholds: AdaptiveThresholds) -> Self {
        Self {
            state: RwLock::new(EventState::new(event_id)),
            thresholds: RwLock::new(thresholds),
            decisions: RwLock::new(Vec::new()),
            recompute_lock: Mutex::new(()),
            optimize_lock: Mutex::new(()),
            cancel: AtomicBool::new(false),
        }
    }

    fn append(&self, decisions: &[DecisionExplanation]) {
        if !decisions.is_empty() {
            self.decisions.write().extend_from_slice(decisions);
        }
    }
}

pub struct GateEngine {
    settings: EngineSettings,
    events: RwLock<FxHashMap<EventId, Arc<EventHandle>>>,
}

impl GateEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings, events: RwLock::new(FxHashMap::default()) }
    }

    /// Engine with every configured event registered
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let engine = Self::new(EngineSettings::from_config(config));
        for event in config.events() {
            let thresholds = event.initial_thresholds()?;
            engine.register_event(event.event_id(), thresholds)?;
        }
        Ok(engine)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Add an event; false if it was already registered
    pub fn register_event(&self, event_id: EventId, thresholds: AdaptiveThresholds) -> Result<bool, EngineError> {
        thresholds.validate()?;
        let mut events = self.events.write();
        if events.contains_key(&event_id) {
            return Ok(false);
        }
        info!(
            event_id = %event_id,
            eps_m = %thresholds.duplicate_distance_meters,
            promotion_samples = %thresholds.promotion_sample_size,
            "event_registered"
        );
        events.insert(event_id.clone(), Arc::new(EventHandle::new(event_id, thresholds)));
        Ok(true)
    }

    /// Registered events, sorted
    pub fn events(&self) -> Vec<EventId> {
        let mut ids: Vec<EventId> = self.events.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn handle(&self, event_id: &EventId) -> Result<Arc<EventHandle>, EngineError> {
        self.events
            .read()
            .get(event_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownEvent(event_id.clone()))
    }

    /// Run one recompute cycle under the configured timeout
    pub fn recompute(
        &self,
        event_id: &EventId,
        checkins: &[CheckinEvent],
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, EngineError> {
        let deadline = Instant::now() + self.settings.cycle_timeout();
        self.recompute_until(event_id, checkins, now, deadline)
    }

    /// Run one recompute cycle that stops at `deadline`
    ///
    /// Returns `Skipped` without touching anything when a cycle is already
    /// running for the event.
    pub fn recompute_until(
        &self,
        event_id: &EventId,
        checkins: &[CheckinEvent],
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<CycleOutcome, EngineError> {
        let handle = self.handle(event_id)?;
        let Some(_guard) = handle.recompute_lock.try_lock() else {
            debug!(event_id = %event_id, "cycle_skipped_lock_held");
            return Ok(CycleOutcome::Skipped);
        };
        handle.cancel.store(false, Ordering::Release);

        let state = handle.state.read().clone();
        let thresholds = handle.thresholds.read().clone();
        let cycle = RecomputeCycle::new(self.settings.policies(), thresholds, &handle.cancel, deadline, now);
        let result = cycle.run(state, checkins);

        let Some(state) = result.state else {
            return Ok(CycleOutcome::NoOp(result.report));
        };
        *handle.state.write() = state;
        handle.append(&result.report.decisions);

        Ok(match result.interrupted {
            None => CycleOutcome::Completed(result.report),
            Some(Interrupt::Cancelled) => CycleOutcome::Cancelled(result.report),
            Some(Interrupt::TimedOut) => CycleOutcome::TimedOut(result.report),
        })
    }

    /// Ask a running cycle to stop at its next checkpoint; false when idle
    pub fn cancel(&self, event_id: &EventId) -> Result<bool, EngineError> {
        let handle = self.handle(event_id)?;
        if !handle.recompute_lock.is_locked() {
            return Ok(false);
        }
        handle.cancel.store(true, Ordering::Release);
        info!(event_id = %event_id, "cycle_cancel_requested");
        Ok(true)
    }

    /// Evaluate recent decisions and adjust the event's thresholds
    pub fn optimize(&self, event_id: &EventId, now: DateTime<Utc>) -> Result<OptimizeOutcome, EngineError> {
        let handle = self.handle(event_id)?;
        let Some(_guard) = handle.optimize_lock.try_lock() else {
            debug!(event_id = %event_id, "optimization_skipped_lock_held");
            return Ok(OptimizeOutcome::Skipped);
        };

        let base = handle.thresholds.read().clone();
        let gates = handle.state.read().gates.clone();
        let mut tuned = base.clone();
        let mut recorder = DecisionRecorder::new(event_id.clone());
        let optimization = {
            let decisions = handle.decisions.read();
            ThresholdOptimizer::new(&self.settings.optimizer, self.settings.learning_window())
                .run(&mut tuned, &decisions, &gates, now, &mut recorder)
        };

        let (accuracy, entries) = match optimization {
            Optimization::InsufficientData { promotions } => {
                return Ok(OptimizeOutcome::InsufficientData { promotions });
            }
            Optimization::Evaluated { accuracy, entries, .. } => (accuracy, entries),
        };
        tuned.validate()?;

        {
            let mut stored = handle.thresholds.write();
            if stored.version != base.version {
                warn!(
                    event_id = %event_id,
                    evaluated = %base.version,
                    current = %stored.version,
                    "optimization_superseded"
                );
                return Ok(OptimizeOutcome::Superseded);
            }
            *stored = tuned;
        }

        let decisions = recorder.into_decisions();
        handle.append(&decisions);
        info!(
            event_id = %event_id,
            accuracy = format!("{:.3}", accuracy),
            adjustments = %entries.len(),
            "optimization_completed"
        );
        Ok(OptimizeOutcome::Evaluated { accuracy, entries, decisions })
    }

    /// Approve or decline a pending merge suggestion
    ///
    /// Fails with `CycleInProgress` while a cycle holds the event lock so a
    /// manual merge never races the cycle's copy of the state.
    pub fn resolve_merge(
        &self,
        event_id: &EventId,
        suggestion_id: &str,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<DecisionExplanation>, EngineError> {
        let handle = self.handle(event_id)?;
        let _guard = handle
            .recompute_lock
            .try_lock()
            .ok_or_else(|| EngineError::CycleInProgress(event_id.clone()))?;

        let thresholds = handle.thresholds.read().clone();
        let tracker = BindingTracker::new(&self.settings.binding, &thresholds);
        let mut recorder = DecisionRecorder::new(event_id.clone());
        let mut state = handle.state.write();

        let idx = state
            .merges
            .iter()
            .position(|m| m.id == suggestion_id)
            .ok_or_else(|| EngineError::UnknownSuggestion { event: event_id.clone(), id: suggestion_id.to_string() })?;
        if state.merges[idx].status != MergeStatus::Pending {
            return Err(EngineError::SuggestionResolved(suggestion_id.to_string()));
        }

        if approve {
            let candidate = merge_detector::candidate_from(&state, &state.merges[idx]).filter(|c| {
                [&c.primary, &c.secondary].iter().all(|id| state.gate(id).is_some_and(Gate::is_live))
            });
            let Some(candidate) = candidate else {
                state.merges[idx].expire(now);
                return Err(EngineError::SuggestionStale(suggestion_id.to_string()));
            };
            merge_detector::execute(&mut state, &candidate, &thresholds, &tracker, &mut recorder, now);
            state.merges[idx].resolve(MergeStatus::Approved, MergeOrigin::Manual, now);
            state.expire_stale_merges(now);
        } else {
            let suggestion = &state.merges[idx];
            let subject = DecisionSubject::Merge {
                primary: suggestion.primary_gate.clone(),
                secondary: suggestion.secondary_gate.clone(),
            };
            let factors = smallvec![Factor::new("operator_decision", 0.0, 1.0, -1.0)
                .with_detail("merge declined by operator")];
            let confidence = ConfidenceBreakdown::new(
                1.0 - (suggestion.distance_meters / thresholds.duplicate_distance_meters).min(1.0),
                suggestion.confidence_score,
                suggestion.traffic_similarity,
                0.0,
            );
            recorder.record(DecisionKind::MergeRejected, subject, factors, confidence, now);
            state.merges[idx].resolve(MergeStatus::Rejected, MergeOrigin::Manual, now);
        }
        drop(state);

        let decisions = recorder.into_decisions();
        handle.append(&decisions);
        Ok(decisions)
    }

    /// Declare a gate by hand; it goes through the same learning lifecycle
    pub fn declare_gate(
        &self,
        event_id: &EventId,
        name: &str,
        latitude: f64,
        longitude: f64,
        now: DateTime<Utc>,
    ) -> Result<Gate, EngineError> {
        let centroid = GeoPoint::new(latitude, longitude)?;
        let handle = self.handle(event_id)?;
        let _guard = handle
            .recompute_lock
            .try_lock()
            .ok_or_else(|| EngineError::CycleInProgress(event_id.clone()))?;

        let gate = Gate::manual(event_id.clone(), name, centroid, now);
        let mut recorder = DecisionRecorder::new(event_id.clone());
        recorder.gate(
            DecisionKind::Created,
            &gate.id,
            smallvec![Factor::new("manual", 1.0, 1.0, 1.0).with_detail(format!("declared by operator as {name}"))],
            ConfidenceBreakdown::new(1.0, 0.0, 0.0, 0.0),
            now,
        );
        handle.state.write().gates.push(gate.clone());
        handle.append(recorder.decisions());
        Ok(gate)
    }

    // Read model

    pub fn gates(&self, event_id: &EventId) -> Result<Vec<Gate>, EngineError> {
        Ok(self.handle(event_id)?.state.read().gates.clone())
    }

    pub fn gate(&self, event_id: &EventId, gate_id: &GateId) -> Result<Option<Gate>, EngineError> {
        Ok(self.handle(event_id)?.state.read().gate(gate_id).cloned())
    }

    pub fn bindings(&self, event_id: &EventId) -> Result<Vec<GateBinding>, EngineError> {
        Ok(self.handle(event_id)?.state.read().bindings.values().cloned().collect())
    }

    pub fn binding_status(
        &self,
        event_id: &EventId,
        gate_id: &GateId,
        category: &Category,
    ) -> Result<Option<BindingStatus>, EngineError> {
        let key = BindingKey::new(gate_id.clone(), category.clone());
        Ok(self.handle(event_id)?.state.read().bindings.get(&key).map(|b| b.status))
    }

    /// Whether wristbands of `category` are enforced at `gate_id`
    pub fn is_enforced(&self, event_id: &EventId, gate_id: &GateId, category: &Category) -> Result<bool, EngineError> {
        Ok(self.binding_status(event_id, gate_id, category)? == Some(BindingStatus::Enforced))
    }

    pub fn merges(&self, event_id: &EventId, status: Option<MergeStatus>) -> Result<Vec<MergeSuggestion>, EngineError> {
        let handle = self.handle(event_id)?;
        let state = handle.state.read();
        Ok(state.merges.iter().filter(|m| status.map_or(true, |s| m.status == s)).cloned().collect())
    }

    pub fn pending_merges(&self, event_id: &EventId) -> Result<Vec<MergeSuggestion>, EngineError> {
        self.merges(event_id, Some(MergeStatus::Pending))
    }

    /// Decisions matching `query`, oldest first
    pub fn decisions(&self, event_id: &EventId, query: &DecisionQuery) -> Result<Vec<DecisionExplanation>, EngineError> {
        let handle = self.handle(event_id)?;
        let decisions = handle.decisions.read();
        Ok(decisions.iter().filter(|d| query.matches(d)).cloned().collect())
    }

    pub fn thresholds(&self, event_id: &EventId) -> Result<AdaptiveThresholds, EngineError> {
        Ok(self.handle(event_id)?.thresholds.read().clone())
    }

    /// Replace an event's thresholds; invalid values leave the current ones
    /// in place
    pub fn set_thresholds(&self, event_id: &EventId, mut thresholds: AdaptiveThresholds) -> Result<u64, EngineError> {
        let handle = self.handle(event_id)?;
        if let Err(e) = thresholds.validate() {
            warn!(event_id = %event_id, error = %e, "thresholds_rejected");
            return Err(e.into());
        }
        let mut stored = handle.thresholds.write();
        thresholds.version = stored.version + 1;
        info!(
            event_id = %event_id,
            version = %thresholds.version,
            eps_m = %thresholds.duplicate_distance_meters,
            "thresholds_replaced"
        );
        *stored = thresholds;
        Ok(stored.version)
    }

    /// Number of recompute cycles committed for the event
    pub fn cycles(&self, event_id: &EventId) -> Result<u64, EngineError> {
        Ok(self.handle(event_id)?.state.read().cycles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gate::{ArchiveReason, GateStatus};
    use crate::domain::geo::GeoPoint;
    use crate::domain::thresholds::VenueType;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 20, 0, 0).unwrap()
    }

    fn origin() -> GeoPoint {
        GeoPoint { lat: 40.7505, lon: -73.9934 }
    }

    fn engine() -> (GateEngine, EventId) {
        let engine = GateEngine::new(EngineSettings::default());
        let ev = EventId::from("ev-1");
        engine.register_event(ev.clone(), AdaptiveThresholds::for_venue(VenueType::Generic)).unwrap();
        (engine, ev)
    }

    /// `n` GA scans within a couple of metres of `at`, one minute apart
    fn burst(prefix: &str, n: usize, at: GeoPoint, start: DateTime<Utc>) -> Vec<CheckinEvent> {
        (0..n)
            .map(|i| {
                let p = at.offset_m((i % 3) as f64, (i % 4) as f64 * 0.5);
                CheckinEvent::new(
                    format!("{prefix}-{i:03}"),
                    "ev-1",
                    format!("{prefix}-w{i}"),
                    "GA",
                    start + Duration::minutes(i as i64),
                )
                .with_location(p.lat, p.lon, 5.0)
            })
            .collect()
    }

    #[test]
    fn test_unknown_event() {
        let (engine, _) = engine();
        let err = engine.recompute(&EventId::from("nope"), &[], now()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownEvent(_)));
    }

    #[test]
    fn test_thin_window_is_noop() {
        let (engine, ev) = engine();
        let checkins = burst("a", 5, origin(), now() - Duration::hours(1));
        let outcome = engine.recompute(&ev, &checkins, now()).unwrap();
        assert!(matches!(outcome, CycleOutcome::NoOp(_)));
        assert!(engine.gates(&ev).unwrap().is_empty());
        assert_eq!(engine.cycles(&ev).unwrap(), 0);
    }

    #[test]
    fn test_cycle_discovers_and_enforces() {
        let (engine, ev) = engine();
        let checkins = burst("a", 60, origin(), now() - Duration::hours(2));
        let outcome = engine.recompute(&ev, &checkins, now()).unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(outcome.as_str(), "completed");
        assert_eq!(report.gates_created, 1);
        assert_eq!(report.scans_processed, 60);
        assert_eq!(report.promotions, 1);

        let gates = engine.gates(&ev).unwrap();
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].status, GateStatus::Learning);
        assert_eq!(gates[0].sample_count, 60);
        assert!(engine.is_enforced(&ev, &gates[0].id, &Category::from("GA")).unwrap());

        // Same snapshot again: nothing new to learn, gate goes active
        let outcome = engine.recompute(&ev, &checkins, now()).unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.gates_created, 0);
        assert_eq!(report.scans_processed, 0);
        let gates = engine.gates(&ev).unwrap();
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].status, GateStatus::Active);
        assert_eq!(gates[0].sample_count, 60);
    }

    #[test]
    fn test_every_transition_has_a_decision() {
        let (engine, ev) = engine();
        let checkins = burst("a", 60, origin(), now() - Duration::hours(2));
        engine.recompute(&ev, &checkins, now()).unwrap();
        engine.recompute(&ev, &checkins, now()).unwrap();

        let gate = engine.gates(&ev).unwrap().remove(0);
        let decisions = engine.decisions(&ev, &DecisionQuery { gate: Some(gate.id.clone()), ..Default::default() }).unwrap();
        let kinds: Vec<DecisionKind> = decisions.iter().map(|d| d.kind).collect();
        // gate created, binding created, binding promoted, gate promoted
        assert_eq!(
            kinds,
            vec![DecisionKind::Created, DecisionKind::Created, DecisionKind::Promoted, DecisionKind::Promoted]
        );
        assert!(decisions.iter().all(|d| !d.primary_reason.is_empty()));
    }

    #[test]
    fn test_stale_gate_is_archived() {
        let (engine, ev) = engine();
        let start = now() - Duration::hours(2);
        engine.recompute(&ev, &burst("a", 30, origin(), start), now()).unwrap();

        // Traffic moves 500 m away; the first gate sees nothing any more
        let elsewhere = origin().offset_m(500.0, 0.0);
        let later = now() + Duration::hours(12);
        let mut feed = Vec::new();
        for cycle in 0..3 {
            let at = later + Duration::minutes(cycle * 10);
            feed.extend(burst(&format!("b{cycle}"), 30, elsewhere, at - Duration::hours(1)));
            engine.recompute(&ev, &feed, at).unwrap();
        }
        let gates = engine.gates(&ev).unwrap();
        let first = &gates[0];
        assert!(matches!(
            first.status,
            GateStatus::AutoArchived { reason: ArchiveReason::Stale { idle_cycles: 3 }, .. }
        ));
        assert!(gates[1].is_live());
    }

    #[test]
    fn test_cycle_skipped_when_lock_held() {
        let (engine, ev) = engine();
        let handle = engine.handle(&ev).unwrap();
        let _guard = handle.recompute_lock.try_lock().unwrap();
        let checkins = burst("a", 30, origin(), now() - Duration::hours(1));
        let outcome = engine.recompute(&ev, &checkins, now()).unwrap();
        assert!(matches!(outcome, CycleOutcome::Skipped));
        assert!(outcome.kind().is_none());
        assert!(engine.gates(&ev).unwrap().is_empty());
        assert!(matches!(engine.resolve_merge(&ev, "x", true, now()), Err(EngineError::CycleInProgress(_))));
    }

    #[test]
    fn test_expired_deadline_keeps_nothing_past_checkpoint() {
        let (engine, ev) = engine();
        let checkins = burst("a", 30, origin(), now() - Duration::hours(1));
        let outcome = engine
            .recompute_until(&ev, &checkins, now(), Instant::now() - std::time::Duration::from_secs(1))
            .unwrap();
        assert!(matches!(outcome, CycleOutcome::TimedOut(_)));
        // Interrupted before discovery: committed but empty
        assert!(engine.gates(&ev).unwrap().is_empty());
        assert_eq!(engine.cycles(&ev).unwrap(), 1);
    }

    #[test]
    fn test_zero_timeout_still_completes() {
        let mut settings = EngineSettings::default();
        settings.engine.cycle_timeout_secs = 0;
        assert_eq!(settings.cycle_timeout(), std::time::Duration::from_secs(1));

        let engine = GateEngine::new(settings);
        let ev = EventId::from("ev-1");
        engine.register_event(ev.clone(), AdaptiveThresholds::default()).unwrap();
        let outcome = engine.recompute(&ev, &burst("a", 30, origin(), now() - Duration::hours(1)), now()).unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(_)));
        assert_eq!(engine.gates(&ev).unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_when_idle() {
        let (engine, ev) = engine();
        assert!(!engine.cancel(&ev).unwrap());
    }

    #[test]
    fn test_invalid_thresholds_keep_previous() {
        let (engine, ev) = engine();
        let mut bad = engine.thresholds(&ev).unwrap();
        bad.confidence_threshold = 1.5;
        assert!(matches!(engine.set_thresholds(&ev, bad), Err(EngineError::Thresholds(_))));
        let current = engine.thresholds(&ev).unwrap();
        assert_eq!(current.confidence_threshold, 0.8);
        assert_eq!(current.version, 1);

        let mut good = current.clone();
        good.duplicate_distance_meters = 30.0;
        assert_eq!(engine.set_thresholds(&ev, good).unwrap(), 2);
        assert_eq!(engine.thresholds(&ev).unwrap().duplicate_distance_meters, 30.0);
    }

    #[test]
    fn test_declare_gate() {
        let (engine, ev) = engine();
        let gate = engine.declare_gate(&ev, "North entrance", 40.75, -73.99, now()).unwrap();
        assert_eq!(gate.status, GateStatus::Learning);
        let decisions = engine.decisions(&ev, &DecisionQuery::default()).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].kind, DecisionKind::Created);
        assert!(matches!(
            engine.declare_gate(&ev, "bad", 91.0, 0.0, now()),
            Err(EngineError::Location(_))
        ));
    }

    #[test]
    fn test_optimize_without_history() {
        let (engine, ev) = engine();
        let outcome = engine.optimize(&ev, now()).unwrap();
        assert_eq!(outcome, OptimizeOutcome::InsufficientData { promotions: 0 });
        assert_eq!(engine.thresholds(&ev).unwrap().version, 1);
    }

    #[test]
    fn test_events_are_isolated() {
        let (engine, ev) = engine();
        let other = EventId::from("ev-2");
        engine.register_event(other.clone(), AdaptiveThresholds::default()).unwrap();
        assert!(!engine.register_event(other.clone(), AdaptiveThresholds::default()).unwrap());

        // Check-ins of ev-1 never leak into ev-2's cycle
        let checkins = burst("a", 60, origin(), now() - Duration::hours(2));
        engine.recompute(&ev, &checkins, now()).unwrap();
        assert!(matches!(engine.recompute(&other, &checkins, now()).unwrap(), CycleOutcome::NoOp(_)));
        assert!(engine.gates(&other).unwrap().is_empty());
        assert_eq!(engine.events(), vec![ev, other]);
    }
}
