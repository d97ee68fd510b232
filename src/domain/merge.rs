//! Merge suggestions between duplicate gates

use crate::domain::types::{new_uuid_v7, GateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Approved,
    Rejected,
    /// A gate of the pair was archived before the suggestion was resolved
    Stale,
}

/// Who resolved the suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOrigin {
    AutoApproved,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSuggestion {
    pub id: String,
    pub primary_gate: GateId,
    pub secondary_gate: GateId,
    pub confidence_score: f64,
    pub distance_meters: f64,
    pub traffic_similarity: f64,
    pub reasoning: String,
    pub status: MergeStatus,
    pub origin: Option<MergeOrigin>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl MergeSuggestion {
    pub fn new(
        primary_gate: GateId,
        secondary_gate: GateId,
        confidence_score: f64,
        distance_meters: f64,
        traffic_similarity: f64,
        reasoning: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_uuid_v7(),
            primary_gate,
            secondary_gate,
            confidence_score,
            distance_meters,
            traffic_similarity,
            reasoning,
            status: MergeStatus::Pending,
            origin: None,
            created_at,
            resolved_at: None,
        }
    }

    /// Same unordered gate pair
    pub fn covers(&self, a: &GateId, b: &GateId) -> bool {
        (&self.primary_gate == a && &self.secondary_gate == b)
            || (&self.primary_gate == b && &self.secondary_gate == a)
    }

    pub fn involves(&self, gate: &GateId) -> bool {
        &self.primary_gate == gate || &self.secondary_gate == gate
    }

    pub fn resolve(&mut self, status: MergeStatus, origin: MergeOrigin, at: DateTime<Utc>) {
        self.status = status;
        self.origin = Some(origin);
        self.resolved_at = Some(at);
    }

    /// Close a pending suggestion nobody can act on any more
    pub fn expire(&mut self, at: DateTime<Utc>) {
        self.status = MergeStatus::Stale;
        self.resolved_at = Some(at);
    }
}
