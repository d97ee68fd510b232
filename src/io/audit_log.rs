//! Decision audit sink - appends every decision to a JSONL file
//!
//! One `DecisionExplanation` JSON object per line, in the order decisions
//! were recorded. The file is append-only; existing content is kept.
//! `DecisionSink` fans decisions out to the file and the MQTT stream.

use crate::domain::decision::DecisionExplanation;
use crate::io::mqtt_egress::DecisionSender;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct AuditLog {
    file_path: String,
}

impl AuditLog {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "audit_log_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Append decisions; returns how many were written
    pub fn write_decisions(&self, decisions: &[DecisionExplanation]) -> usize {
        if decisions.is_empty() {
            return 0;
        }
        let mut lines = String::with_capacity(decisions.len() * 512);
        let mut written = 0;
        for decision in decisions {
            match serde_json::to_string(decision) {
                Ok(json) => {
                    lines.push_str(&json);
                    lines.push('\n');
                    written += 1;
                }
                Err(e) => error!(decision_id = %decision.id, error = %e, "audit_serialize_failed"),
            }
        }

        match self.append(&lines) {
            Ok(()) => {
                debug!(file = %self.file_path, decisions = %written, "audit_written");
                written
            }
            Err(e) => {
                error!(file = %self.file_path, error = %e, "audit_write_failed");
                0
            }
        }
    }

    fn append(&self, content: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(content.as_bytes())
    }
}

/// Where recorded decisions go: the audit file, the MQTT stream, or both
#[derive(Clone, Default)]
pub struct DecisionSink {
    audit: Option<Arc<AuditLog>>,
    egress: Option<DecisionSender>,
}

impl DecisionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_audit_log(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_egress(mut self, egress: DecisionSender) -> Self {
        self.egress = Some(egress);
        self
    }

    pub fn publish(&self, decisions: &[DecisionExplanation]) {
        if decisions.is_empty() {
            return;
        }
        if let Some(audit) = &self.audit {
            audit.write_decisions(decisions);
        }
        if let Some(egress) = &self.egress {
            egress.send_all(decisions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::decision::{ConfidenceBreakdown, DecisionKind, DecisionSubject, Factor};
    use crate::domain::types::{EventId, GateId};
    use chrono::{TimeZone, Utc};
    use smallvec::smallvec;
    use std::fs;
    use tempfile::tempdir;

    fn decision(kind: DecisionKind, gate: &str) -> DecisionExplanation {
        DecisionExplanation::new(
            EventId::from("ev-1"),
            kind,
            DecisionSubject::Gate { gate: GateId::from(gate) },
            smallvec![Factor::new("sample_count", 40.0, 0.3, 0.3).with_detail("40 scans")],
            ConfidenceBreakdown::new(0.9, 0.8, 0.5, 1.0),
            Utc.with_ymd_and_hms(2026, 7, 4, 18, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_write_decisions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let audit = AuditLog::new(path.to_str().unwrap());

        let written = audit.write_decisions(&[decision(DecisionKind::Created, "g1"), decision(DecisionKind::Archived, "g2")]);
        assert_eq!(written, 2);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: DecisionExplanation = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.kind, DecisionKind::Archived);
        assert_eq!(parsed.primary_reason, "40 scans");
    }

    #[test]
    fn test_append_mode_and_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("audit").join("decisions.jsonl");
        let audit = AuditLog::new(path.to_str().unwrap());

        audit.write_decisions(&[decision(DecisionKind::Created, "g1")]);
        audit.write_decisions(&[decision(DecisionKind::Promoted, "g1")]);
        assert_eq!(audit.write_decisions(&[]), 0);

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn test_sink_fans_out_to_file_and_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let (sender, mut rx) = crate::io::mqtt_egress::create_decision_channel(8, "venue".to_string());
        let sink = DecisionSink::new()
            .with_audit_log(Arc::new(AuditLog::new(path.to_str().unwrap())))
            .with_egress(sender);

        sink.publish(&[decision(DecisionKind::Merged, "g1")]);
        sink.publish(&[]);

        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
