//! Decision explanations: the append-only audit record of every autonomous action

use crate::domain::binding::BindingKey;
use crate::domain::types::{new_uuid_v7, EventId, GateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Created,
    Promoted,
    Demoted,
    Rejected,
    Merged,
    Archived,
    MergeSuggested,
    MergeRejected,
    ThresholdAdjusted,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Created => "created",
            DecisionKind::Promoted => "promoted",
            DecisionKind::Demoted => "demoted",
            DecisionKind::Rejected => "rejected",
            DecisionKind::Merged => "merged",
            DecisionKind::Archived => "archived",
            DecisionKind::MergeSuggested => "merge_suggested",
            DecisionKind::MergeRejected => "merge_rejected",
            DecisionKind::ThresholdAdjusted => "threshold_adjusted",
        }
    }
}

impl std::str::FromStr for DecisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => DecisionKind::Created,
            "promoted" => DecisionKind::Promoted,
            "demoted" => DecisionKind::Demoted,
            "rejected" => DecisionKind::Rejected,
            "merged" => DecisionKind::Merged,
            "archived" => DecisionKind::Archived,
            "merge_suggested" => DecisionKind::MergeSuggested,
            "merge_rejected" => DecisionKind::MergeRejected,
            "threshold_adjusted" => DecisionKind::ThresholdAdjusted,
            other => return Err(format!("unknown decision kind: {other}")),
        })
    }
}

/// What a decision acted on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionSubject {
    Gate { gate: GateId },
    Binding { key: BindingKey },
    Merge { primary: GateId, secondary: GateId },
    Thresholds,
}

impl DecisionSubject {
    /// Whether the subject concerns the given gate
    pub fn involves(&self, gate_id: &GateId) -> bool {
        match self {
            DecisionSubject::Gate { gate } => gate == gate_id,
            DecisionSubject::Binding { key } => &key.gate == gate_id,
            DecisionSubject::Merge { primary, secondary } => {
                primary == gate_id || secondary == gate_id
            }
            DecisionSubject::Thresholds => false,
        }
    }
}

/// One weighted input to a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub metric: String,
    pub value: f64,
    pub weight: f64,
    /// Signed contribution; positive supports the decision
    pub impact: f64,
    /// Human-readable phrasing used when this factor dominates
    pub detail: String,
}

impl Factor {
    pub fn new(metric: &str, value: f64, weight: f64, impact: f64) -> Self {
        Self {
            metric: metric.to_string(),
            value,
            weight,
            impact,
            detail: format!("{metric} = {value:.3}"),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Confidence split across the four audit dimensions, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub spatial_consistency: f64,
    pub sample_size: f64,
    pub temporal_stability: f64,
    pub category_distribution: f64,
}

impl ConfidenceBreakdown {
    pub fn new(
        spatial_consistency: f64,
        sample_size: f64,
        temporal_stability: f64,
        category_distribution: f64,
    ) -> Self {
        Self {
            spatial_consistency: clamp_unit(spatial_consistency),
            sample_size: clamp_unit(sample_size),
            temporal_stability: clamp_unit(temporal_stability),
            category_distribution: clamp_unit(category_distribution),
        }
    }

    pub fn overall(&self) -> f64 {
        (self.spatial_consistency
            + self.sample_size
            + self.temporal_stability
            + self.category_distribution)
            / 4.0
    }
}

#[inline]
fn clamp_unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionExplanation {
    pub id: String,
    pub event_id: EventId,
    pub kind: DecisionKind,
    pub subject: DecisionSubject,
    pub factors: SmallVec<[Factor; 4]>,
    pub primary_reason: String,
    pub confidence: ConfidenceBreakdown,
    pub at: DateTime<Utc>,
}

impl DecisionExplanation {
    pub fn new(
        event_id: EventId,
        kind: DecisionKind,
        subject: DecisionSubject,
        factors: SmallVec<[Factor; 4]>,
        confidence: ConfidenceBreakdown,
        at: DateTime<Utc>,
    ) -> Self {
        let primary_reason = dominant_reason(&factors)
            .unwrap_or_else(|| format!("{} without supporting factors", kind.as_str()));
        Self { id: new_uuid_v7(), event_id, kind, subject, factors, primary_reason, confidence, at }
    }
}

/// Detail of the factor with the largest absolute impact (first wins ties)
fn dominant_reason(factors: &[Factor]) -> Option<String> {
    let mut best: Option<&Factor> = None;
    for factor in factors {
        match best {
            Some(b) if factor.impact.abs() <= b.impact.abs() => {}
            _ => best = Some(factor),
        }
    }
    best.map(|f| f.detail.clone())
}

/// Audit log filter; every set field must match
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionQuery {
    pub gate: Option<GateId>,
    pub kind: Option<DecisionKind>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DecisionQuery {
    pub fn matches(&self, decision: &DecisionExplanation) -> bool {
        if let Some(gate) = &self.gate {
            if !decision.subject.involves(gate) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if decision.kind != kind {
                return false;
            }
        }
        if let Some(from) = self.from {
            if decision.at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if decision.at > to {
                return false;
            }
        }
        true
    }
}
