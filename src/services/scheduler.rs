//! Drives the engine: periodic recompute and optimization for every event,
//! plus on-demand triggers
//!
//! Check-ins are fetched once per cycle from the `CheckinSource`; the cycle
//! itself runs on the blocking pool. A trigger for an event whose cycle is
//! still running is skipped by the engine's per-event lock, so triggers can
//! be fired freely. Decisions of every cycle go to the audit log and, when
//! configured, to the MQTT decision stream.

use crate::domain::types::EventId;
use crate::infra::metrics::Metrics;
use crate::io::audit_log::{AuditLog, DecisionSink};
use crate::io::feed::CheckinSource;
use crate::io::mqtt_egress::DecisionSender;
use crate::services::engine::{CycleOutcome, GateEngine, OptimizeOutcome};
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// On-demand request for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Recompute(EventId),
    Optimize(EventId),
    Cancel(EventId),
}

impl Trigger {
    pub fn event_id(&self) -> &EventId {
        match self {
            Trigger::Recompute(e) | Trigger::Optimize(e) | Trigger::Cancel(e) => e,
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    engine: Arc<GateEngine>,
    source: Arc<dyn CheckinSource>,
    metrics: Arc<Metrics>,
    sink: DecisionSink,
    recompute_interval: Duration,
    optimize_interval: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<GateEngine>, source: Arc<dyn CheckinSource>, metrics: Arc<Metrics>) -> Self {
        let settings = engine.settings();
        let recompute_interval = Duration::from_secs(settings.engine.recompute_interval_secs.max(1));
        let optimize_interval = Duration::from_secs(settings.engine.optimize_interval_secs.max(1));
        Self { engine, source, metrics, sink: DecisionSink::new(), recompute_interval, optimize_interval }
    }

    pub fn with_audit_log(mut self, audit: Arc<AuditLog>) -> Self {
        self.sink = self.sink.with_audit_log(audit);
        self
    }

    pub fn with_egress(mut self, egress: DecisionSender) -> Self {
        self.sink = self.sink.with_egress(egress);
        self
    }

    /// The decision fan-out, shared with callers that record decisions
    /// outside a cycle
    pub fn sink(&self) -> DecisionSink {
        self.sink.clone()
    }

    /// Fetch the window and run one recompute cycle for `event_id`
    pub async fn recompute_event(&self, event_id: &EventId) -> anyhow::Result<CycleOutcome> {
        let now = Utc::now();
        let since = now - self.engine.settings().learning_window();
        let checkins = match self.source.snapshot(event_id, since).await {
            Ok(checkins) => checkins,
            Err(e) => {
                self.metrics.record_cycle_failed();
                return Err(e.context(format!("failed to fetch check-ins for event {event_id}")));
            }
        };

        let engine = self.engine.clone();
        let event = event_id.clone();
        let joined = tokio::task::spawn_blocking(move || engine.recompute(&event, &checkins, now)).await;
        let outcome = match joined {
            Ok(result) => result?,
            Err(e) => {
                self.metrics.record_cycle_failed();
                return Err(anyhow::Error::new(e).context(format!("recompute task failed for event {event_id}")));
            }
        };

        match outcome.kind() {
            Some(kind) => {
                if let Some(report) = outcome.report() {
                    self.metrics.record_cycle(report, kind);
                }
            }
            None => {
                self.metrics.record_cycle_skipped();
                info!(event_id = %event_id, "cycle_skipped");
            }
        }
        if matches!(outcome, CycleOutcome::Cancelled(_) | CycleOutcome::TimedOut(_)) {
            warn!(event_id = %event_id, outcome = %outcome.as_str(), "cycle_stopped_early");
        }
        self.sink.publish(outcome.decisions());
        Ok(outcome)
    }

    /// Run one threshold optimization for `event_id`
    pub async fn optimize_event(&self, event_id: &EventId) -> anyhow::Result<OptimizeOutcome> {
        let engine = self.engine.clone();
        let event = event_id.clone();
        let now = Utc::now();
        let outcome = tokio::task::spawn_blocking(move || engine.optimize(&event, now))
            .await
            .with_context(|| format!("optimize task failed for event {event_id}"))??;

        match &outcome {
            OptimizeOutcome::Evaluated { entries, decisions, .. } => {
                self.metrics.record_optimization(entries.len(), decisions.len());
            }
            OptimizeOutcome::Skipped | OptimizeOutcome::InsufficientData { .. } | OptimizeOutcome::Superseded => {
                self.metrics.record_optimization_skipped();
            }
        }
        self.sink.publish(outcome.decisions());
        Ok(outcome)
    }

    fn spawn_recompute(&self, event_id: EventId) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.recompute_event(&event_id).await {
                error!(event_id = %event_id, error = %format!("{e:#}"), "cycle_failed");
            }
        });
    }

    fn spawn_optimize(&self, event_id: EventId) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.optimize_event(&event_id).await {
                error!(event_id = %event_id, error = %format!("{e:#}"), "optimization_failed");
            }
        });
    }

    /// Act on one trigger without waiting for the work to finish
    pub fn dispatch(&self, trigger: Trigger) {
        debug!(trigger = ?trigger, "trigger_received");
        match trigger {
            Trigger::Recompute(event_id) => self.spawn_recompute(event_id),
            Trigger::Optimize(event_id) => self.spawn_optimize(event_id),
            Trigger::Cancel(event_id) => match self.engine.cancel(&event_id) {
                Ok(true) => {}
                Ok(false) => debug!(event_id = %event_id, "cancel_no_cycle_running"),
                Err(e) => warn!(event_id = %event_id, error = %e, "cancel_failed"),
            },
        }
    }

    /// Run until shutdown; running cycles are asked to stop on the way out
    pub async fn run(self, mut triggers: mpsc::Receiver<Trigger>, mut shutdown: watch::Receiver<bool>) {
        info!(
            recompute_secs = %self.recompute_interval.as_secs(),
            optimize_secs = %self.optimize_interval.as_secs(),
            events = %self.engine.events().len(),
            "scheduler_started"
        );
        let mut recompute = tokio::time::interval(self.recompute_interval);
        let mut optimize = tokio::time::interval(self.optimize_interval);
        recompute.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        optimize.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first optimize tick fires immediately; there is no history yet
        optimize.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        for event_id in self.engine.events() {
                            let _ = self.engine.cancel(&event_id);
                        }
                        info!("scheduler_shutdown");
                        return;
                    }
                }
                _ = recompute.tick() => {
                    for event_id in self.engine.events() {
                        self.spawn_recompute(event_id);
                    }
                }
                _ = optimize.tick() => {
                    for event_id in self.engine.events() {
                        self.spawn_optimize(event_id);
                    }
                }
                Some(trigger) = triggers.recv() => {
                    self.dispatch(trigger);
                }
            }
        }
    }
}
