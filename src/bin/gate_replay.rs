//! Gate Replay - runs recorded check-ins through the engine offline
//!
//! Loads a JSONL check-in file, runs N recompute cycles per event (and
//! optionally a threshold optimization after each), then prints the read
//! model as JSON on stdout. Logs go to stderr.
//!
//! Usage:
//!   gate-replay --checkins data/checkins.jsonl
//!   gate-replay --checkins data/checkins.jsonl --event fest-2026 --cycles 5 --venue festival

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use gate_discovery::domain::decision::DecisionQuery;
use gate_discovery::domain::thresholds::{AdaptiveThresholds, VenueType};
use gate_discovery::domain::types::{CheckinEvent, EventId};
use gate_discovery::infra::Config;
use gate_discovery::io::load_jsonl;
use gate_discovery::services::{CycleOutcome, GateEngine, OptimizeOutcome};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Gate Replay - offline recompute over a check-in file
#[derive(Parser, Debug)]
#[command(name = "gate-replay", version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file (engine policies, event thresholds)
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// JSONL file with one check-in per line
    #[arg(long)]
    checkins: String,

    /// Replay only this event; default is every event in the file
    #[arg(short, long)]
    event: Option<String>,

    /// Recompute cycles to run per event
    #[arg(short = 'n', long, default_value_t = 3)]
    cycles: u32,

    /// Venue type seeding thresholds for events missing from the config
    #[arg(long, default_value = "generic")]
    venue: VenueType,

    /// Run a threshold optimization after every cycle
    #[arg(long)]
    optimize: bool,
}

fn cycle_summary(cycle: u32, at: DateTime<Utc>, outcome: &CycleOutcome) -> Value {
    match outcome.report() {
        Some(r) => json!({
            "cycle": cycle,
            "at": at,
            "outcome": outcome.as_str(),
            "checkins": r.checkins,
            "scans_processed": r.scans_processed,
            "gates_created": r.gates_created,
            "gates_archived": r.gates_archived,
            "promotions": r.promotions,
            "demotions": r.demotions,
            "rejections": r.rejections,
            "merges_executed": r.merges_executed,
            "merges_suggested": r.merges_suggested,
            "duration_ms": r.duration_ms,
        }),
        None => json!({ "cycle": cycle, "at": at, "outcome": outcome.as_str() }),
    }
}

fn optimize_summary(outcome: &OptimizeOutcome) -> Value {
    match outcome {
        OptimizeOutcome::Skipped => json!({ "outcome": "skipped" }),
        OptimizeOutcome::Superseded => json!({ "outcome": "superseded" }),
        OptimizeOutcome::InsufficientData { promotions } => {
            json!({ "outcome": "insufficient_data", "promotions": promotions })
        }
        OptimizeOutcome::Evaluated { accuracy, entries, .. } => {
            json!({ "outcome": "evaluated", "accuracy": accuracy, "adjustments": entries })
        }
    }
}

fn replay_event(
    engine: &GateEngine,
    event_id: &EventId,
    checkins: &[CheckinEvent],
    args: &Args,
    step: chrono::Duration,
) -> anyhow::Result<Value> {
    let Some(last) = checkins.iter().map(|c| c.timestamp).max() else {
        return Ok(json!({ "event_id": event_id, "checkins": 0 }));
    };

    let mut cycles = Vec::with_capacity(args.cycles as usize);
    let mut optimizations = Vec::new();
    for i in 0..args.cycles {
        let now = last + step * i as i32;
        let outcome = engine.recompute(event_id, checkins, now)?;
        info!(event_id = %event_id, cycle = %(i + 1), outcome = %outcome.as_str(), "replay_cycle");
        cycles.push(cycle_summary(i + 1, now, &outcome));

        if args.optimize {
            optimizations.push(optimize_summary(&engine.optimize(event_id, now)?));
        }
    }

    Ok(json!({
        "event_id": event_id,
        "checkins": checkins.len(),
        "cycles": cycles,
        "optimizations": optimizations,
        "thresholds": engine.thresholds(event_id)?,
        "gates": engine.gates(event_id)?,
        "bindings": engine.bindings(event_id)?,
        "merges": engine.merges(event_id, None)?,
        "decisions": engine.decisions(event_id, &DecisionQuery::default())?,
    }))
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);
    let engine = GateEngine::from_config(&config).context("invalid event configuration")?;

    let (checkins, malformed) = load_jsonl(&args.checkins)?;

    let mut by_event: BTreeMap<EventId, Vec<CheckinEvent>> = BTreeMap::new();
    for checkin in checkins {
        by_event.entry(checkin.event_id.clone()).or_default().push(checkin);
    }
    if let Some(only) = &args.event {
        let only = EventId::from(only.as_str());
        by_event.retain(|event_id, _| *event_id == only);
        by_event.entry(only).or_default();
    }

    let step = chrono::Duration::from_std(config.recompute_interval()).context("recompute interval out of range")?;
    let mut events = Vec::with_capacity(by_event.len());
    for (event_id, checkins) in &by_event {
        if engine.register_event(event_id.clone(), AdaptiveThresholds::for_venue(args.venue))? {
            info!(event_id = %event_id, venue = %args.venue.as_str(), "replay_event_seeded");
        }
        events.push(replay_event(&engine, event_id, checkins, &args, step)?);
    }

    let output = json!({
        "source": args.checkins,
        "malformed_lines": malformed,
        "events": events,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
