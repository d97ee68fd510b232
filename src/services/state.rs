//! Mutable gate/binding model of one event
//!
//! A recompute cycle clones this, works on the copy, and swaps the copy back
//! in at cycle end. Gates are only ever appended; archival is a status.

use crate::domain::gate::Gate;
use crate::domain::merge::{MergeStatus, MergeSuggestion};
use crate::domain::types::{CheckinId, EventId, GateId};
use crate::services::binding_tracker::BindingMap;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

/// Gate a processed check-in counts toward
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub gate: GateId,
    /// Scan time, used to prune entries that left the learning window
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EventState {
    pub event_id: EventId,
    /// Creation order; never shrinks
    pub gates: Vec<Gate>,
    pub bindings: BindingMap,
    pub merges: Vec<MergeSuggestion>,
    /// Check-ins already fed to the binding tracker
    pub attributions: FxHashMap<CheckinId, Attribution>,
    /// Discovered-gate counter used for naming
    pub gates_discovered: usize,
    pub cycles: u64,
}

impl EventState {
    pub fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            gates: Vec::new(),
            bindings: BindingMap::new(),
            merges: Vec::new(),
            attributions: FxHashMap::default(),
            gates_discovered: 0,
            cycles: 0,
        }
    }

    pub fn gate(&self, id: &GateId) -> Option<&Gate> {
        self.gates.iter().find(|g| &g.id == id)
    }

    pub fn gate_mut(&mut self, id: &GateId) -> Option<&mut Gate> {
        self.gates.iter_mut().find(|g| &g.id == id)
    }

    pub fn live_gates(&self) -> impl Iterator<Item = &Gate> {
        self.gates.iter().filter(|g| g.is_live())
    }

    #[inline]
    pub fn is_processed(&self, checkin: &CheckinId) -> bool {
        self.attributions.contains_key(checkin)
    }

    pub fn gate_of(&self, checkin: &CheckinId) -> Option<&GateId> {
        self.attributions.get(checkin).map(|a| &a.gate)
    }

    pub fn attribute(&mut self, checkin: CheckinId, gate: GateId, at: DateTime<Utc>) {
        self.attributions.insert(checkin, Attribution { gate, at });
    }

    /// Point every check-in of `from` at `to`
    pub fn redirect(&mut self, from: &GateId, to: &GateId) -> usize {
        let mut moved = 0;
        for attribution in self.attributions.values_mut() {
            if &attribution.gate == from {
                attribution.gate = to.clone();
                moved += 1;
            }
        }
        moved
    }

    /// Forget check-ins older than the window start; they can never be
    /// re-fetched, so they can never be re-processed either
    pub fn prune_attributions(&mut self, window_start: DateTime<Utc>) -> usize {
        let before = self.attributions.len();
        self.attributions.retain(|_, a| a.at >= window_start);
        before - self.attributions.len()
    }

    /// An unresolved or declined suggestion already covers this pair
    pub fn has_open_or_rejected(&self, a: &GateId, b: &GateId) -> bool {
        self.merges
            .iter()
            .any(|m| m.covers(a, b) && matches!(m.status, MergeStatus::Pending | MergeStatus::Rejected))
    }

    /// Mark pending suggestions whose pair is no longer live as stale
    pub fn expire_stale_merges(&mut self, at: DateTime<Utc>) -> usize {
        let live: Vec<GateId> = self.live_gates().map(|g| g.id.clone()).collect();
        let mut expired = 0;
        for merge in self.merges.iter_mut().filter(|m| m.status == MergeStatus::Pending) {
            if !live.contains(&merge.primary_gate) || !live.contains(&merge.secondary_gate) {
                merge.expire(at);
                expired += 1;
            }
        }
        expired
    }

    pub fn pending_merges(&self) -> impl Iterator<Item = &MergeSuggestion> {
        self.merges.iter().filter(|m| m.status == MergeStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_redirect_and_prune() {
        let t0 = Utc.with_ymd_and_hms(2026, 7, 4, 18, 0, 0).unwrap();
        let mut state = EventState::new(EventId::from("ev"));
        let (a, b) = (GateId::from("a"), GateId::from("b"));
        state.attribute(CheckinId::from("c1"), a.clone(), t0);
        state.attribute(CheckinId::from("c2"), b.clone(), t0 + Duration::hours(2));
        state.attribute(CheckinId::from("c3"), b.clone(), t0 + Duration::hours(3));

        assert_eq!(state.redirect(&b, &a), 2);
        assert_eq!(state.gate_of(&CheckinId::from("c3")), Some(&a));

        assert_eq!(state.prune_attributions(t0 + Duration::hours(1)), 1);
        assert!(!state.is_processed(&CheckinId::from("c1")));
        assert!(state.is_processed(&CheckinId::from("c2")));
    }
}
