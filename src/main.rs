//! Gate discovery service
//!
//! Learns venue gates from live check-ins and keeps gate/category bindings
//! current. Check-ins arrive over MQTT (and optionally a JSONL preload); a
//! scheduler runs recompute and optimization cycles per event; the read
//! model is served over HTTP.
//!
//! Module structure:
//! - `domain/` - Gates, bindings, thresholds, decisions, geo primitives
//! - `io/` - External interfaces (check-in feed, MQTT, audit log, HTTP)
//! - `services/` - Engine (clustering, binding tracker, merges, optimizer)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use gate_discovery::infra::{Config, Metrics};
use gate_discovery::io::{
    create_decision_channel, load_jsonl, start_checkin_ingest, start_http_server, AuditLog,
    DecisionPublisher, HttpState, MemoryFeed,
};
use gate_discovery::services::{GateEngine, Scheduler};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Gate discovery - learns and enforces venue gates from check-ins
#[derive(Parser, Debug)]
#[command(name = "gate-discovery", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controls verbosity; default INFO, debug shows per-scan evidence
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "gate-discovery starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        events = %config.events().len(),
        learning_window_hours = %config.engine().learning_window_hours,
        recompute_interval_secs = %config.engine().recompute_interval_secs,
        optimize_interval_secs = %config.engine().optimize_interval_secs,
        mqtt_enabled = %config.mqtt().enabled,
        http_port = %config.http_port(),
        audit_file = %config.audit_file(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = Arc::new(GateEngine::from_config(&config).context("invalid event configuration")?);
    let metrics = Arc::new(Metrics::new());
    let feed = Arc::new(MemoryFeed::new());

    // Preload a check-in file (replayed history or a static export)
    if let Some(path) = config.feed_jsonl() {
        let (checkins, malformed) = load_jsonl(path)?;
        let added = feed.extend(checkins);
        for _ in 0..malformed {
            metrics.record_checkin_malformed();
        }
        info!(file = %path, checkins = %added, "feed_preloaded");
    }

    // Live check-ins over MQTT
    if config.mqtt().enabled {
        let mqtt_config = config.mqtt().clone();
        let ingest_feed = feed.clone();
        let ingest_metrics = metrics.clone();
        let ingest_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_checkin_ingest(&mqtt_config, ingest_feed, ingest_metrics, ingest_shutdown).await {
                error!(error = %format!("{e:#}"), "mqtt_ingest_error");
            }
        });
    } else {
        warn!("mqtt_disabled_feed_is_static");
    }

    let mut scheduler = Scheduler::new(engine.clone(), feed.clone(), metrics.clone())
        .with_audit_log(Arc::new(AuditLog::new(config.audit_file())));

    // Decision stream over MQTT
    if config.mqtt().enabled {
        let (decision_sender, decision_rx) = create_decision_channel(1000, config.site_id().to_string());
        let publisher = DecisionPublisher::new(config.mqtt(), decision_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
        scheduler = scheduler.with_egress(decision_sender);
    }

    // On-demand triggers (bounded; a full queue rejects instead of piling up)
    let (trigger_tx, trigger_rx) = mpsc::channel(64);

    let http_port = config.http_port();
    if http_port > 0 {
        let state = Arc::new(HttpState {
            engine: engine.clone(),
            metrics: metrics.clone(),
            site_id: config.site_id().to_string(),
            triggers: Some(trigger_tx.clone()),
            sink: scheduler.sink(),
        });
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(http_port, state, http_shutdown).await {
                error!(error = %format!("{e:#}"), "http_server_error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Check-ins older than the learning window can never reach a cycle again
    let prune_feed = feed.clone();
    let learning_window = config.learning_window();
    let prune_every = config.recompute_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(prune_every);
        loop {
            interval.tick().await;
            let dropped = prune_feed.prune_before(chrono::Utc::now() - learning_window);
            if dropped > 0 {
                info!(dropped = %dropped, remaining = %prune_feed.len(), "feed_pruned");
            }
        }
    });

    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Runs until shutdown; keep one trigger sender alive so the channel stays open
    let _trigger_tx = trigger_tx;
    scheduler.run(trigger_rx, shutdown_rx).await;

    info!("gate-discovery shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_precedence() {
        // One test owns CONFIG_FILE so parallel tests never see it half-set
        std::env::set_var("CONFIG_FILE", "config/from-env.toml");
        let from_env = Args::try_parse_from(["gate-discovery"]).unwrap();
        assert_eq!(from_env.config, "config/from-env.toml");
        let from_flag = Args::try_parse_from(["gate-discovery", "--config", "config/arena.toml"]).unwrap();
        assert_eq!(from_flag.config, "config/arena.toml");

        std::env::remove_var("CONFIG_FILE");
        let fallback = Args::try_parse_from(["gate-discovery"]).unwrap();
        assert_eq!(fallback.config, "config/dev.toml");
    }
}
