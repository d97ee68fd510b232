//! Check-in feeds
//!
//! The engine only reads check-ins, once per cycle, through `CheckinSource`.
//! `MemoryFeed` is the append-only store MQTT ingest writes into; it can be
//! seeded from a JSONL file (one `CheckinEvent` JSON object per line).

use crate::domain::types::{CheckinEvent, CheckinId, EventId};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

#[async_trait]
pub trait CheckinSource: Send + Sync {
    /// Check-ins of `event_id` recorded at or after `since`
    async fn snapshot(&self, event_id: &EventId, since: DateTime<Utc>) -> anyhow::Result<Vec<CheckinEvent>>;
}

#[derive(Default)]
struct FeedInner {
    by_event: FxHashMap<EventId, Vec<CheckinEvent>>,
    seen: FxHashSet<CheckinId>,
}

/// In-memory append-only check-in feed
#[derive(Default)]
pub struct MemoryFeed {
    inner: RwLock<FeedInner>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a check-in; false if its id was already recorded
    pub fn push(&self, checkin: CheckinEvent) -> bool {
        let mut inner = self.inner.write();
        if !inner.seen.insert(checkin.id.clone()) {
            debug!(checkin_id = %checkin.id, "checkin_duplicate");
            return false;
        }
        inner.by_event.entry(checkin.event_id.clone()).or_default().push(checkin);
        true
    }

    pub fn extend(&self, checkins: impl IntoIterator<Item = CheckinEvent>) -> usize {
        checkins.into_iter().map(|c| self.push(c)).filter(|added| *added).count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop check-ins older than `cutoff`; they can no longer reach a window
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();
        let FeedInner { by_event, seen } = &mut *inner;
        let mut dropped = 0;
        for checkins in by_event.values_mut() {
            checkins.retain(|c| {
                let keep = c.timestamp >= cutoff;
                if !keep {
                    seen.remove(&c.id);
                    dropped += 1;
                }
                keep
            });
        }
        by_event.retain(|_, v| !v.is_empty());
        dropped
    }
}

#[async_trait]
impl CheckinSource for MemoryFeed {
    async fn snapshot(&self, event_id: &EventId, since: DateTime<Utc>) -> anyhow::Result<Vec<CheckinEvent>> {
        let inner = self.inner.read();
        Ok(inner
            .by_event
            .get(event_id)
            .map(|checkins| checkins.iter().filter(|c| c.timestamp >= since).cloned().collect())
            .unwrap_or_default())
    }
}

/// Parse one feed line
pub fn parse_checkin(line: &str) -> anyhow::Result<CheckinEvent> {
    serde_json::from_str(line).context("invalid check-in JSON")
}

/// Check-ins of a JSONL file plus the number of malformed lines skipped
pub fn load_jsonl<P: AsRef<Path>>(path: P) -> anyhow::Result<(Vec<CheckinEvent>, usize)> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read check-in file {}", path.display()))?;

    let mut checkins = Vec::new();
    let mut malformed = 0usize;
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_checkin(line) {
            Ok(checkin) => checkins.push(checkin),
            Err(e) => {
                malformed += 1;
                warn!(file = %path.display(), line = %(lineno + 1), error = %e, "checkin_line_malformed");
            }
        }
    }
    info!(file = %path.display(), checkins = %checkins.len(), malformed = %malformed, "checkins_loaded");
    Ok((checkins, malformed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 18, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_filters_event_and_time() {
        let feed = MemoryFeed::new();
        feed.push(CheckinEvent::new("c1", "ev-1", "w1", "GA", t0()));
        feed.push(CheckinEvent::new("c2", "ev-1", "w2", "GA", t0() + Duration::hours(2)));
        feed.push(CheckinEvent::new("c3", "ev-2", "w3", "VIP", t0() + Duration::hours(2)));

        let snap = feed.snapshot(&EventId::from("ev-1"), t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id.as_str(), "c2");

        let none = feed.snapshot(&EventId::from("ev-9"), t0()).await.unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_duplicates_and_prune() {
        let feed = MemoryFeed::new();
        assert!(feed.push(CheckinEvent::new("c1", "ev-1", "w1", "GA", t0())));
        assert!(!feed.push(CheckinEvent::new("c1", "ev-1", "w1", "GA", t0())));
        feed.push(CheckinEvent::new("c2", "ev-1", "w2", "GA", t0() + Duration::hours(5)));
        assert_eq!(feed.len(), 2);

        assert_eq!(feed.prune_before(t0() + Duration::hours(1)), 1);
        assert_eq!(feed.len(), 1);
        // A pruned id may be recorded again
        assert!(feed.push(CheckinEvent::new("c1", "ev-1", "w1", "GA", t0() + Duration::hours(6))));
    }

    #[test]
    fn test_load_jsonl_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkins.jsonl");
        let good = serde_json::to_string(
            &CheckinEvent::new("c1", "ev-1", "w1", "GA", t0()).with_location(40.75, -73.99, 5.0),
        )
        .unwrap();
        let minimal = r#"{"id":"c2","event_id":"ev-1","wristband_id":"w2","timestamp":"2026-07-04T18:01:00Z","category":"VIP","status":"denied"}"#;
        fs::write(&path, format!("{good}\nnot json\n\n{minimal}\n")).unwrap();

        let (checkins, malformed) = load_jsonl(&path).unwrap();
        assert_eq!(checkins.len(), 2);
        assert_eq!(malformed, 1);
        assert!(checkins[0].location.is_some());
        assert!(checkins[1].location.is_none());
        assert!(checkins[1].signals.is_empty());
    }

    #[test]
    fn test_load_jsonl_missing_file() {
        let err = load_jsonl("/nonexistent/checkins.jsonl").unwrap_err();
        assert!(err.to_string().contains("failed to read check-in file"));
    }
}
