//! Gate binding: the (gate, category) permission with its confidence lifecycle

use crate::domain::types::{Category, GateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Binding state. Absence of a binding row is the implicit initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingStatus {
    Probation,
    Enforced,
    /// Terminal
    Rejected,
}

impl BindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingStatus::Probation => "probation",
            BindingStatus::Enforced => "enforced",
            BindingStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingKey {
    pub gate: GateId,
    pub category: Category,
}

impl BindingKey {
    pub fn new(gate: GateId, category: Category) -> Self {
        Self { gate, category }
    }
}

impl std::fmt::Display for BindingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.gate, self.category)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateBinding {
    pub gate_id: GateId,
    pub category: Category,
    pub status: BindingStatus,
    /// Always within [0, 1]
    pub confidence: f64,
    pub sample_count: u64,
    pub violation_count: u64,
    pub bound_at: DateTime<Utc>,
    pub last_violation_at: Option<DateTime<Utc>>,
    /// Scan time at which confidence last dropped below the rejection floor
    pub low_confidence_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl GateBinding {
    /// New binding in probation with no evidence yet
    pub fn probation(gate_id: GateId, category: Category, at: DateTime<Utc>) -> Self {
        Self {
            gate_id,
            category,
            status: BindingStatus::Probation,
            confidence: 0.0,
            sample_count: 0,
            violation_count: 0,
            bound_at: at,
            last_violation_at: None,
            low_confidence_since: None,
            updated_at: at,
        }
    }

    pub fn key(&self) -> BindingKey {
        BindingKey::new(self.gate_id.clone(), self.category.clone())
    }

    #[inline]
    pub fn is_enforced(&self) -> bool {
        self.status == BindingStatus::Enforced
    }

    #[inline]
    pub fn is_rejected(&self) -> bool {
        self.status == BindingStatus::Rejected
    }

    /// Violations per sample; a binding with no samples and any violation is 1.0+
    pub fn violation_ratio(&self) -> f64 {
        if self.sample_count == 0 {
            return self.violation_count as f64;
        }
        self.violation_count as f64 / self.sample_count as f64
    }

    /// Total scans that touched this binding
    #[inline]
    pub fn observations(&self) -> u64 {
        self.sample_count + self.violation_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_binding_is_probation_without_evidence() {
        let at = Utc.with_ymd_and_hms(2026, 7, 4, 18, 0, 0).unwrap();
        let b = GateBinding::probation(GateId::from("g1"), Category::from("GA"), at);
        assert_eq!(b.status, BindingStatus::Probation);
        assert_eq!(b.confidence, 0.0);
        assert_eq!(b.observations(), 0);
        assert_eq!(b.key().to_string(), "g1/GA");
    }

    #[test]
    fn test_violation_ratio() {
        let at = Utc.with_ymd_and_hms(2026, 7, 4, 18, 0, 0).unwrap();
        let mut b = GateBinding::probation(GateId::from("g1"), Category::from("GA"), at);
        b.sample_count = 40;
        b.violation_count = 10;
        assert!((b.violation_ratio() - 0.25).abs() < f64::EPSILON);
    }
}
