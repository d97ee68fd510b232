//! Gate model: a physical entry point inferred from clustered check-ins

use crate::domain::geo::GeoPoint;
use crate::domain::types::{Category, EventId, GateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a gate left the live set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveReason {
    /// Absorbed by a duplicate gate
    MergedInto { primary: GateId },
    /// No scans for this many consecutive cycles
    Stale { idle_cycles: u32 },
    /// Health score fell below the archive floor
    Unhealthy { health_score: f64 },
}

impl ArchiveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveReason::MergedInto { .. } => "merged_into",
            ArchiveReason::Stale { .. } => "stale",
            ArchiveReason::Unhealthy { .. } => "unhealthy",
        }
    }
}

/// Gate lifecycle status
///
/// Archived gates are never removed from the owning collection so historical
/// check-ins keep a valid reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GateStatus {
    Learning,
    Active,
    AutoArchived { reason: ArchiveReason, at: DateTime<Utc> },
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Learning => "learning",
            GateStatus::Active => "active",
            GateStatus::AutoArchived { .. } => "auto_archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationMethod {
    AutoDiscovered,
    Manual,
}

/// Composite reliability metric for a gate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub score: f64,
    pub success_rate: f64,
    pub latency_score: f64,
    pub uptime: f64,
}

impl Default for HealthScore {
    fn default() -> Self {
        Self { score: 1.0, success_rate: 1.0, latency_score: 1.0, uptime: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub id: GateId,
    pub event_id: EventId,
    pub name: String,
    #[serde(flatten)]
    pub status: GateStatus,
    pub centroid: GeoPoint,
    /// Mean squared distance (m²) of the gate's window scans from the centroid
    pub spatial_variance: f64,
    pub derivation: DerivationMethod,
    pub discovery_confidence: f64,
    pub health: HealthScore,
    /// Check-ins ever attributed to this gate (merges add the absorbed gate's)
    pub sample_count: u64,
    /// Check-ins attributed in the current learning window
    pub window_sample_count: u64,
    /// Consecutive cycles with no scans in the window
    pub idle_cycles: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Gate {
    /// A gate freshly discovered from a cluster, in `learning`
    pub fn discovered(
        event_id: EventId,
        sequence: usize,
        dominant: &Category,
        centroid: GeoPoint,
        spatial_variance: f64,
        discovery_confidence: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: GateId::generate(),
            event_id,
            name: format!("Gate {sequence} ({dominant})"),
            status: GateStatus::Learning,
            centroid,
            spatial_variance,
            derivation: DerivationMethod::AutoDiscovered,
            discovery_confidence,
            health: HealthScore::default(),
            sample_count: 0,
            window_sample_count: 0,
            idle_cycles: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// An operator-declared gate; it still goes through the learning lifecycle
    pub fn manual(event_id: EventId, name: &str, centroid: GeoPoint, now: DateTime<Utc>) -> Self {
        Self {
            id: GateId::generate(),
            event_id,
            name: name.to_string(),
            status: GateStatus::Learning,
            centroid,
            spatial_variance: 0.0,
            derivation: DerivationMethod::Manual,
            discovery_confidence: 1.0,
            health: HealthScore::default(),
            sample_count: 0,
            window_sample_count: 0,
            idle_cycles: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn is_archived(&self) -> bool {
        matches!(self.status, GateStatus::AutoArchived { .. })
    }

    /// Learning or active
    #[inline]
    pub fn is_live(&self) -> bool {
        !self.is_archived()
    }

    pub fn archive(&mut self, reason: ArchiveReason, at: DateTime<Utc>) {
        self.status = GateStatus::AutoArchived { reason, at };
        self.updated_at = at;
    }

    /// Ordering used to pick the surviving gate of a merge
    ///
    /// More samples wins, then the older gate, then the lower id.
    pub fn outranks(&self, other: &Gate) -> bool {
        rank_key(self) < rank_key(other)
    }
}

/// Sort key where the smaller key is the stronger gate
fn rank_key(gate: &Gate) -> (std::cmp::Reverse<u64>, DateTime<Utc>, &GateId) {
    (std::cmp::Reverse(gate.sample_count), gate.created_at, &gate.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn gate(samples: u64, created_offset_min: i64) -> Gate {
        let now = Utc.with_ymd_and_hms(2026, 7, 4, 18, 0, 0).unwrap();
        let mut g = Gate::discovered(
            EventId::from("ev"),
            1,
            &Category::from("GA"),
            GeoPoint::new(55.0, 12.0).unwrap(),
            4.0,
            0.9,
            now + Duration::minutes(created_offset_min),
        );
        g.sample_count = samples;
        g
    }

    #[test]
    fn test_discovered_gate_is_learning() {
        let g = gate(0, 0);
        assert_eq!(g.status, GateStatus::Learning);
        assert_eq!(g.derivation, DerivationMethod::AutoDiscovered);
        assert_eq!(g.name, "Gate 1 (GA)");
        assert!(g.is_live());
    }

    #[test]
    fn test_archive_keeps_reason() {
        let mut g = gate(10, 0);
        let at = g.created_at + Duration::hours(1);
        g.archive(ArchiveReason::Stale { idle_cycles: 3 }, at);
        assert!(g.is_archived());
        assert_eq!(g.status.as_str(), "auto_archived");
        assert_eq!(g.updated_at, at);
    }

    #[test]
    fn test_outranks_prefers_samples_then_age() {
        let big = gate(40, 10);
        let small = gate(30, 0);
        assert!(big.outranks(&small));
        assert!(!small.outranks(&big));

        let older = gate(30, 0);
        let newer = gate(30, 5);
        assert!(older.outranks(&newer));
        assert!(!newer.outranks(&older));
    }

    #[test]
    fn test_gate_serializes_status_flat() {
        let g = gate(1, 0);
        let json = serde_json::to_value(&g).unwrap();
        assert_eq!(json["status"], "learning");
    }
}
