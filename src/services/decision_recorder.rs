//! Decision recorder
//!
//! Every gate, binding, merge and threshold transition passes through here
//! and produces exactly one `DecisionExplanation`. The recorder collects a
//! cycle's decisions so the engine can append them to the audit log in one
//! batch at cycle end.

use crate::domain::binding::BindingKey;
use crate::domain::decision::{
    ConfidenceBreakdown, DecisionExplanation, DecisionKind, DecisionSubject, Factor,
};
use crate::domain::types::{EventId, GateId};
use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use tracing::info;

pub type Factors = SmallVec<[Factor; 4]>;

pub struct DecisionRecorder {
    event_id: EventId,
    decisions: Vec<DecisionExplanation>,
}

impl DecisionRecorder {
    pub fn new(event_id: EventId) -> Self {
        Self { event_id, decisions: Vec::new() }
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Record one decision and log it
    pub fn record(
        &mut self,
        kind: DecisionKind,
        subject: DecisionSubject,
        factors: Factors,
        confidence: ConfidenceBreakdown,
        at: DateTime<Utc>,
    ) -> &DecisionExplanation {
        let decision =
            DecisionExplanation::new(self.event_id.clone(), kind, subject, factors, confidence, at);
        info!(
            event_id = %self.event_id,
            kind = %kind.as_str(),
            subject = %subject_label(&decision.subject),
            confidence = format!("{:.2}", decision.confidence.overall()),
            reason = %decision.primary_reason,
            "decision_recorded"
        );
        self.decisions.push(decision);
        // Just pushed
        &self.decisions[self.decisions.len() - 1]
    }

    pub fn gate(
        &mut self,
        kind: DecisionKind,
        gate: &GateId,
        factors: Factors,
        confidence: ConfidenceBreakdown,
        at: DateTime<Utc>,
    ) -> &DecisionExplanation {
        self.record(kind, DecisionSubject::Gate { gate: gate.clone() }, factors, confidence, at)
    }

    pub fn binding(
        &mut self,
        kind: DecisionKind,
        key: BindingKey,
        factors: Factors,
        confidence: ConfidenceBreakdown,
        at: DateTime<Utc>,
    ) -> &DecisionExplanation {
        self.record(kind, DecisionSubject::Binding { key }, factors, confidence, at)
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn decisions(&self) -> &[DecisionExplanation] {
        &self.decisions
    }

    pub fn into_decisions(self) -> Vec<DecisionExplanation> {
        self.decisions
    }
}

fn subject_label(subject: &DecisionSubject) -> String {
    match subject {
        DecisionSubject::Gate { gate } => format!("gate:{gate}"),
        DecisionSubject::Binding { key } => format!("binding:{key}"),
        DecisionSubject::Merge { primary, secondary } => format!("merge:{secondary}->{primary}"),
        DecisionSubject::Thresholds => "thresholds".to_string(),
    }
}
