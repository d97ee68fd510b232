//! End-to-end engine scenarios: discovery, duplicate merging, demotion,
//! attribution violations, health archival, isolation and manual merge
//! disposition

use chrono::{DateTime, Duration, TimeZone, Utc};
use gate_discovery::domain::binding::BindingStatus;
use gate_discovery::domain::decision::{DecisionKind, DecisionQuery};
use gate_discovery::domain::gate::{ArchiveReason, Gate, GateStatus};
use gate_discovery::domain::geo::{self, GeoPoint};
use gate_discovery::domain::merge::MergeStatus;
use gate_discovery::domain::thresholds::AdaptiveThresholds;
use gate_discovery::domain::types::{Category, CheckinEvent, CheckinStatus, EventId};
use gate_discovery::infra::config::MergePolicy;
use gate_discovery::services::{CycleOutcome, EngineError, EngineSettings, GateEngine};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 15, 17, 0, 0).unwrap()
}

fn origin() -> GeoPoint {
    GeoPoint::new(51.5560, -0.2796).unwrap()
}

fn scan(id: String, category: &str, at: DateTime<Utc>, p: GeoPoint) -> CheckinEvent {
    let wristband = format!("w-{id}");
    CheckinEvent::new(id, "ev", wristband, category, at).with_location(p.lat, p.lon, 6.0)
}

/// `count` scans within about a metre of `north_m` north of the origin,
/// `spacing` apart starting at `from`
fn group(prefix: &str, category: &str, north_m: f64, count: usize, from: DateTime<Utc>, spacing: Duration) -> Vec<CheckinEvent> {
    (0..count)
        .map(|i| {
            let p = origin().offset_m(north_m + (i % 3) as f64 * 0.5 - 0.5, (i % 4) as f64 * 0.4 - 0.6);
            scan(format!("{prefix}{i:03}"), category, from + spacing * i as i32, p)
        })
        .collect()
}

fn latest(checkins: &[CheckinEvent]) -> DateTime<Utc> {
    checkins.iter().map(|c| c.timestamp).max().unwrap()
}

fn engine_with(settings: EngineSettings, thresholds: AdaptiveThresholds) -> (GateEngine, EventId) {
    let engine = GateEngine::new(settings);
    let ev = EventId::from("ev");
    engine.register_event(ev.clone(), thresholds).unwrap();
    (engine, ev)
}

fn live(engine: &GateEngine, ev: &EventId) -> Vec<Gate> {
    engine.gates(ev).unwrap().into_iter().filter(Gate::is_live).collect()
}

/// The live gate centred near `north_m` north of the origin
fn gate_near(engine: &GateEngine, ev: &EventId, north_m: f64) -> Gate {
    let target = origin().offset_m(north_m, 0.0);
    engine
        .gates(ev)
        .unwrap()
        .into_iter()
        .find(|g| geo::distance_m(g.centroid, target) < 5.0)
        .unwrap()
}

/// (sample_count, violation_count) of the gate's GA binding
fn ga_counts(engine: &GateEngine, ev: &EventId, gate: &Gate) -> (u64, u64) {
    let binding = engine
        .bindings(ev)
        .unwrap()
        .into_iter()
        .find(|b| b.gate_id == gate.id && b.category == Category::from("GA"))
        .unwrap();
    (binding.sample_count, binding.violation_count)
}

fn report(outcome: CycleOutcome) -> gate_discovery::services::CycleReport {
    match outcome {
        CycleOutcome::Completed(r) => r,
        other => panic!("expected a completed cycle, got {}", other.as_str()),
    }
}

#[test]
fn test_single_cluster_is_discovered_and_enforced() {
    let (engine, ev) = engine_with(EngineSettings::default(), AdaptiveThresholds::default());
    let ga = Category::from("GA");

    // 60 scans over 2 hours inside a 15m radius
    let checkins: Vec<CheckinEvent> = (0..60)
        .map(|i| {
            let angle = (i as f64 * 37.0).to_radians();
            let radius = (i % 4) as f64 * 4.0;
            let p = origin().offset_m(radius * angle.cos(), radius * angle.sin());
            scan(format!("c{i:03}"), "GA", start() + Duration::minutes(2 * i), p)
        })
        .collect();

    let r = report(engine.recompute(&ev, &checkins, latest(&checkins)).unwrap());
    assert_eq!(r.gates_created, 1);
    assert_eq!(r.scans_processed, 60);

    let gates = engine.gates(&ev).unwrap();
    assert_eq!(gates.len(), 1);
    let gate = &gates[0];
    assert_eq!(gate.status, GateStatus::Learning);
    assert_eq!(gate.sample_count, 60);
    assert!(gate.name.contains("GA"));
    assert!(gate.spatial_variance < 15.0 * 15.0);

    assert!(engine.is_enforced(&ev, &gate.id, &ga).unwrap());
    let binding = engine.bindings(&ev).unwrap().remove(0);
    assert!(binding.sample_count >= 50);
    assert!(binding.confidence >= 0.8);

    let promoted = engine
        .decisions(&ev, &DecisionQuery { kind: Some(DecisionKind::Promoted), ..Default::default() })
        .unwrap();
    assert_eq!(promoted.len(), 1);
    assert!(promoted[0].primary_reason.contains("confidence"));
}

#[test]
fn test_duplicate_gates_merge_once_epsilon_widens() {
    let mut narrow = AdaptiveThresholds::default();
    narrow.duplicate_distance_meters = 5.0;
    let (engine, ev) = engine_with(EngineSettings::default(), narrow);

    // Two groups 8m apart with identical hourly traffic
    let mut checkins = group("a", "GA", 0.0, 40, start(), Duration::minutes(3));
    checkins.extend(group("b", "GA", 8.0, 40, start(), Duration::minutes(3)));
    let now = latest(&checkins);

    let first = report(engine.recompute(&ev, &checkins, now).unwrap());
    assert_eq!(first.gates_created, 2);
    assert_eq!(first.merges_executed + first.merges_suggested, 0);
    assert!(engine.bindings(&ev).unwrap().iter().all(|b| b.status == BindingStatus::Probation));

    let mut wide = engine.thresholds(&ev).unwrap();
    wide.duplicate_distance_meters = 20.0;
    assert_eq!(engine.set_thresholds(&ev, wide).unwrap(), 2);

    let second = report(engine.recompute(&ev, &checkins, now).unwrap());
    assert_eq!(second.merges_executed, 1);
    assert_eq!(second.gates_created, 0);
    // 40 + 40 folded scans clear the promotion bar
    assert_eq!(second.promotions, 1);

    let gates = engine.gates(&ev).unwrap();
    assert_eq!(gates.len(), 2, "the absorbed gate is archived, not removed");
    let survivors = live(&engine, &ev);
    assert_eq!(survivors.len(), 1);
    let primary = &survivors[0];
    assert_eq!(primary.sample_count, 80);
    let absorbed = gates.iter().find(|g| g.id != primary.id).unwrap();
    assert_eq!(
        absorbed.status,
        GateStatus::AutoArchived {
            reason: ArchiveReason::MergedInto { primary: primary.id.clone() },
            at: now
        }
    );

    let merges = engine.merges(&ev, Some(MergeStatus::Approved)).unwrap();
    assert_eq!(merges.len(), 1);
    assert!(merges[0].confidence_score > 0.85);
    assert!(merges[0].traffic_similarity > 0.9);

    // Next cycle: the gate turns active, and the merged pair is not revisited
    let third = report(engine.recompute(&ev, &checkins, now).unwrap());
    assert_eq!(third.merges_executed + third.merges_suggested, 0);
    assert_eq!(engine.merges(&ev, None).unwrap().len(), 1);
    assert_eq!(engine.gate(&ev, &primary.id).unwrap().unwrap().status, GateStatus::Active);
}

#[test]
fn test_cross_category_scans_demote_enforced_binding() {
    let mut thresholds = AdaptiveThresholds::default();
    thresholds.promotion_sample_size = 30;
    let (engine, ev) = engine_with(EngineSettings::default(), thresholds);
    let ga = Category::from("GA");
    let vip = Category::from("VIP");

    let mut checkins = group("ga", "GA", 0.0, 40, start(), Duration::minutes(3));
    engine.recompute(&ev, &checkins, latest(&checkins)).unwrap();
    let gate = engine.gates(&ev).unwrap().remove(0);
    assert!(engine.is_enforced(&ev, &gate.id, &ga).unwrap());

    // 15 consecutive VIP scans at the same spot
    checkins.extend(group("vip", "VIP", 0.0, 15, start() + Duration::hours(2), Duration::minutes(2)));
    let r = report(engine.recompute(&ev, &checkins, latest(&checkins)).unwrap());
    assert_eq!(r.scans_processed, 15);
    assert_eq!(r.demotions, 1);

    let bindings = engine.bindings(&ev).unwrap();
    let ga_binding = bindings.iter().find(|b| b.category == ga).unwrap();
    assert_eq!(ga_binding.status, BindingStatus::Probation);
    assert_eq!(ga_binding.sample_count, 40);
    // Demotion fires on the 11th violation (11 > 0.25 * 40); after that GA is
    // no longer enforced and collects no more cross-category violations
    assert_eq!(ga_binding.violation_count, 11);
    assert_eq!(engine.binding_status(&ev, &gate.id, &vip).unwrap(), Some(BindingStatus::Probation));

    let demoted = engine
        .decisions(&ev, &DecisionQuery { kind: Some(DecisionKind::Demoted), gate: Some(gate.id.clone()), ..Default::default() })
        .unwrap();
    assert_eq!(demoted.len(), 1);
    assert!(demoted[0].primary_reason.starts_with("11 violations against 40 scans"));
}

#[test]
fn test_stray_and_implausibly_fast_scans_are_violations() {
    let (engine, ev) = engine_with(EngineSettings::default(), AdaptiveThresholds::default());
    let mut checkins = group("a", "GA", 0.0, 30, start(), Duration::minutes(2));
    checkins.extend(group("b", "GA", 500.0, 30, start(), Duration::minutes(2)));
    let first = latest(&checkins);
    report(engine.recompute(&ev, &checkins, first).unwrap());
    assert_eq!(live(&engine, &ev).len(), 2);

    // 30 m from A: past epsilon (20 m) but within twice epsilon
    checkins.push(scan("stray".to_string(), "GA", first + Duration::minutes(1), origin().offset_m(30.0, 0.0)));
    // One wristband at A, then at B 500 m away ten seconds later
    let at_a = origin();
    let at_b = origin().offset_m(500.0, 0.0);
    let t = first + Duration::minutes(2);
    checkins.push(CheckinEvent::new("wv-1", "ev", "wv", "GA", t).with_location(at_a.lat, at_a.lon, 6.0));
    checkins.push(
        CheckinEvent::new("wv-2", "ev", "wv", "GA", t + Duration::seconds(10)).with_location(at_b.lat, at_b.lon, 6.0),
    );

    let r = report(engine.recompute(&ev, &checkins, latest(&checkins)).unwrap());
    assert_eq!(r.scans_processed, 3);
    assert_eq!(r.gates_created, 0);

    let a = gate_near(&engine, &ev, 0.0);
    let b = gate_near(&engine, &ev, 500.0);
    // A: the wristband's first scan is evidence, the stray scan a geospatial violation
    assert_eq!(ga_counts(&engine, &ev, &a), (31, 1));
    // B: 50 m/s from A is a temporal violation
    assert_eq!(ga_counts(&engine, &ev, &b), (30, 1));
    assert_eq!(a.sample_count, 32);
    assert_eq!(b.sample_count, 31);
}

#[test]
fn test_failing_gate_is_archived_as_unhealthy() {
    let (engine, ev) = engine_with(EngineSettings::default(), AdaptiveThresholds::default());
    // Healthy traffic spread over four hours
    let mut checkins = group("b", "GA", 500.0, 30, start(), Duration::minutes(7));
    // A gate that only denies, slowly, and only during the last hour
    checkins.extend(
        group("a", "GA", 0.0, 30, start() + Duration::minutes(180), Duration::minutes(1))
            .into_iter()
            .map(|c| c.with_status(CheckinStatus::Denied).with_latency_ms(5000)),
    );
    let now = latest(&checkins) + Duration::minutes(1);

    report(engine.recompute(&ev, &checkins, now).unwrap());
    assert_eq!(live(&engine, &ev).len(), 2);

    // Health is scored from the scans the first cycle attributed
    let r = report(engine.recompute(&ev, &checkins, now).unwrap());
    assert_eq!(r.gates_archived, 1);

    let gates = engine.gates(&ev).unwrap();
    let failing = gates.iter().find(|g| !g.is_live()).unwrap();
    let GateStatus::AutoArchived { reason: ArchiveReason::Unhealthy { health_score }, at } = &failing.status else {
        panic!("expected an unhealthy archival, got {:?}", failing.status);
    };
    // no successes, latency over budget, one active hour of four
    assert!((health_score - 0.0625).abs() < 1e-9, "health {health_score}");
    assert_eq!(*at, now);
    assert!(geo::distance_m(failing.centroid, origin()) < 5.0);
    assert!(gate_near(&engine, &ev, 500.0).is_live());

    let archived = engine
        .decisions(&ev, &DecisionQuery { kind: Some(DecisionKind::Archived), ..Default::default() })
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert!(archived[0].primary_reason.starts_with("health 0.0"));
    assert!(archived[0].primary_reason.ends_with("below floor 0.20"));
}

#[test]
fn test_distant_dissimilar_clusters_never_pair() {
    let (engine, ev) = engine_with(EngineSettings::default(), AdaptiveThresholds::default());

    let mut checkins = group("n", "GA", 0.0, 15, start(), Duration::minutes(3));
    checkins.extend(group("s", "GA", 60.0, 15, start() + Duration::hours(2), Duration::minutes(3)));
    let now = latest(&checkins);

    for _ in 0..2 {
        engine.recompute(&ev, &checkins, now).unwrap();
    }
    assert_eq!(live(&engine, &ev).len(), 2);
    assert!(engine.merges(&ev, None).unwrap().is_empty());
    let merge_decisions = engine
        .decisions(&ev, &DecisionQuery { kind: Some(DecisionKind::MergeSuggested), ..Default::default() })
        .unwrap();
    assert!(merge_decisions.is_empty());
}

#[test]
fn test_discovery_ignores_input_order() {
    let mut checkins = group("a", "GA", 0.0, 25, start(), Duration::minutes(4));
    checkins.extend(group("b", "VIP", 45.0, 25, start(), Duration::minutes(4)));
    let now = latest(&checkins);
    let mut reversed = checkins.clone();
    reversed.reverse();

    let summary = |input: &[CheckinEvent]| {
        let (engine, ev) = engine_with(EngineSettings::default(), AdaptiveThresholds::default());
        engine.recompute(&ev, input, now).unwrap();
        let mut gates: Vec<(String, u64, GeoPoint)> =
            engine.gates(&ev).unwrap().into_iter().map(|g| (g.name, g.sample_count, g.centroid)).collect();
        gates.sort_by(|x, y| x.0.cmp(&y.0));
        gates
    };

    let forward = summary(&checkins);
    assert_eq!(forward.len(), 2);
    assert_eq!(forward, summary(&reversed));
}

/// Two gates 8m apart, discovered at eps 5 and compared at eps 20 under an
/// auto-approve bar high enough to leave the pair pending
fn pending_pair() -> (GateEngine, EventId, Vec<CheckinEvent>, DateTime<Utc>) {
    let settings = EngineSettings {
        merge: MergePolicy { auto_approve_confidence: 0.99, ..MergePolicy::default() },
        ..EngineSettings::default()
    };
    let mut narrow = AdaptiveThresholds::default();
    narrow.duplicate_distance_meters = 5.0;
    let (engine, ev) = engine_with(settings, narrow);

    let mut checkins = group("a", "GA", 0.0, 40, start(), Duration::minutes(3));
    checkins.extend(group("b", "GA", 8.0, 40, start(), Duration::minutes(3)));
    let now = latest(&checkins);
    engine.recompute(&ev, &checkins, now).unwrap();

    let mut wide = engine.thresholds(&ev).unwrap();
    wide.duplicate_distance_meters = 20.0;
    engine.set_thresholds(&ev, wide).unwrap();
    let r = report(engine.recompute(&ev, &checkins, now).unwrap());
    assert_eq!(r.merges_suggested, 1);
    assert_eq!(r.merges_executed, 0);
    (engine, ev, checkins, now)
}

#[test]
fn test_manual_merge_rejection_is_final() {
    let (engine, ev, checkins, now) = pending_pair();
    let pending = engine.pending_merges(&ev).unwrap();
    assert_eq!(pending.len(), 1);

    let decisions = engine.resolve_merge(&ev, &pending[0].id, false, now).unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].kind, DecisionKind::MergeRejected);
    assert_eq!(decisions[0].primary_reason, "merge declined by operator");

    // The declined pair is never suggested again
    let r = report(engine.recompute(&ev, &checkins, now).unwrap());
    assert_eq!(r.merges_suggested, 0);
    assert_eq!(engine.merges(&ev, None).unwrap().len(), 1);
    assert_eq!(engine.merges(&ev, Some(MergeStatus::Rejected)).unwrap().len(), 1);
    assert_eq!(live(&engine, &ev).len(), 2);

    let again = engine.resolve_merge(&ev, &pending[0].id, true, now);
    assert!(matches!(again, Err(EngineError::SuggestionResolved(_))));
}

#[test]
fn test_manual_merge_approval_absorbs_secondary() {
    let (engine, ev, _, now) = pending_pair();
    let suggestion = engine.pending_merges(&ev).unwrap().remove(0);

    let decisions = engine.resolve_merge(&ev, &suggestion.id, true, now).unwrap();
    let kinds: Vec<DecisionKind> = decisions.iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec![DecisionKind::Merged, DecisionKind::Promoted]);

    let survivors = live(&engine, &ev);
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].id, suggestion.primary_gate);
    assert_eq!(survivors[0].sample_count, 80);
    assert!(engine.is_enforced(&ev, &suggestion.primary_gate, &Category::from("GA")).unwrap());
    assert!(engine.pending_merges(&ev).unwrap().is_empty());

    let unknown = engine.resolve_merge(&ev, "no-such-suggestion", true, now);
    assert!(matches!(unknown, Err(EngineError::UnknownSuggestion { .. })));
}
