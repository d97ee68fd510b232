//! Configuration loading from TOML files
//!
//! The binaries pick the file with `--config <path>`, else the CONFIG_FILE
//! environment variable, else config/dev.toml.

use crate::domain::thresholds::{AdaptiveThresholds, ThresholdOverrides, VenueType};
use crate::domain::types::EventId;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Recompute cycle scheduling and input filtering
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Span of check-ins considered by each recompute cycle
    pub learning_window_hours: u64,
    pub recompute_interval_secs: u64,
    pub optimize_interval_secs: u64,
    /// Cycles running longer than this are aborted between gates
    pub cycle_timeout_secs: u64,
    /// Locations with a worse accuracy radius are treated as GPS-denied
    pub max_location_accuracy_m: f64,
    pub stale_cycles_before_archive: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            learning_window_hours: 4,
            recompute_interval_secs: 300,
            optimize_interval_secs: 3600,
            cycle_timeout_secs: 60,
            max_location_accuracy_m: 100.0,
            stale_cycles_before_archive: 3,
        }
    }
}

/// Confidence update and transition limits for gate bindings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BindingPolicy {
    /// Fraction of the remaining distance to 1.0 gained per consistent scan
    pub evidence_weight: f64,
    /// Confidence lost per violating scan
    pub violation_step: f64,
    /// Enforced bindings demote once violations exceed this share of samples
    pub demotion_violation_ratio: f64,
    /// Absolute violation count that rejects a binding
    pub max_violations: u64,
    pub rejection_confidence_floor: f64,
    /// Scan time confidence must stay under the floor before rejection
    pub rejection_grace_secs: i64,
    pub min_observations: u64,
}

impl Default for BindingPolicy {
    fn default() -> Self {
        Self {
            evidence_weight: 0.05,
            violation_step: 0.10,
            demotion_violation_ratio: 0.25,
            max_violations: 100,
            rejection_confidence_floor: 0.2,
            rejection_grace_secs: 1800,
            min_observations: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergePolicy {
    /// Minimum hourly-traffic cosine similarity for a merge candidate
    pub similarity_floor: f64,
    /// Suggestions at or above this confidence execute immediately
    pub auto_approve_confidence: f64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self { similarity_floor: 0.7, auto_approve_confidence: 0.85 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptimizerPolicy {
    pub target_accuracy: f64,
    /// Promotions needed in the evaluation window before tuning anything
    pub min_decisions: usize,
    /// Largest relative change to one parameter per run
    pub max_step_fraction: f64,
    /// Mean gate variance / eps² above which clusters count as loose
    pub high_variance_ratio: f64,
    /// Share of crowded low-sample gates above which eps is loosened
    pub fragmentation_ratio: f64,
}

impl Default for OptimizerPolicy {
    fn default() -> Self {
        Self {
            target_accuracy: 0.9,
            min_decisions: 5,
            max_step_fraction: 0.1,
            high_variance_ratio: 0.25,
            fragmentation_ratio: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    pub latency_budget_ms: f64,
    /// Gates scoring below this (with enough scans) are archived
    pub archive_floor: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self { latency_budget_ms: 2000.0, archive_floor: 0.2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Topic filter for incoming check-in JSON payloads
    #[serde(default = "default_checkins_topic")]
    pub checkins_topic: String,
    /// Topic decisions are published to (QoS 1)
    #[serde(default = "default_decisions_topic")]
    pub decisions_topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_checkins_topic() -> String {
    "checkins/#".to_string()
}

fn default_decisions_topic() -> String {
    "gates/decisions".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            checkins_topic: default_checkins_topic(),
            decisions_topic: default_decisions_topic(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FeedConfig {
    /// JSONL file of check-ins preloaded into the in-memory feed
    #[serde(default)]
    pub jsonl: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// File path for the decision audit log (JSONL format)
    #[serde(default = "default_audit_file")]
    pub file: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { file: default_audit_file() }
    }
}

fn default_audit_file() -> String {
    "decisions.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// HTTP port for /metrics and the read model (0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), http_port: default_http_port() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_http_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "venue".to_string()
}

/// An event registered with the engine at startup
#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    pub id: String,
    #[serde(default)]
    pub venue_type: VenueType,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub thresholds: ThresholdOverrides,
}

impl EventConfig {
    pub fn event_id(&self) -> EventId {
        EventId::from(self.id.as_str())
    }

    /// Venue seed values with overrides applied and validated
    pub fn initial_thresholds(&self) -> anyhow::Result<AdaptiveThresholds> {
        self.thresholds
            .apply(AdaptiveThresholds::for_venue(self.venue_type))
            .with_context(|| format!("invalid thresholds for event {}", self.id))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub binding: BindingPolicy,
    #[serde(default)]
    pub merge: MergePolicy,
    #[serde(default)]
    pub optimizer: OptimizerPolicy,
    #[serde(default)]
    pub health: HealthPolicy,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    engine: EngineConfig,
    binding: BindingPolicy,
    merge: MergePolicy,
    optimizer: OptimizerPolicy,
    health: HealthPolicy,
    mqtt: MqttConfig,
    feed_jsonl: Option<String>,
    audit_file: String,
    metrics_interval_secs: u64,
    http_port: u16,
    events: Vec<EventConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            engine: EngineConfig::default(),
            binding: BindingPolicy::default(),
            merge: MergePolicy::default(),
            optimizer: OptimizerPolicy::default(),
            health: HealthPolicy::default(),
            mqtt: MqttConfig::default(),
            feed_jsonl: None,
            audit_file: default_audit_file(),
            metrics_interval_secs: default_metrics_interval(),
            http_port: default_http_port(),
            events: Vec::new(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        for event in &toml_config.events {
            event.initial_thresholds()?;
        }

        Ok(Self {
            site_id: toml_config.site.id,
            engine: toml_config.engine,
            binding: toml_config.binding,
            merge: toml_config.merge,
            optimizer: toml_config.optimizer,
            health: toml_config.health,
            mqtt: toml_config.mqtt,
            feed_jsonl: toml_config.feed.jsonl,
            audit_file: toml_config.audit.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            http_port: toml_config.metrics.http_port,
            events: toml_config.events,
            config_file: path.display().to_string(),
        })
    }

    /// Load from an explicit path, falling back to defaults on any error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn binding_policy(&self) -> &BindingPolicy {
        &self.binding
    }

    pub fn merge_policy(&self) -> &MergePolicy {
        &self.merge
    }

    pub fn optimizer_policy(&self) -> &OptimizerPolicy {
        &self.optimizer
    }

    pub fn health_policy(&self) -> &HealthPolicy {
        &self.health
    }

    pub fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    pub fn feed_jsonl(&self) -> Option<&str> {
        self.feed_jsonl.as_deref()
    }

    pub fn audit_file(&self) -> &str {
        &self.audit_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn events(&self) -> &[EventConfig] {
        &self.events
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn learning_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.engine.learning_window_hours as i64)
    }

    pub fn recompute_interval(&self) -> Duration {
        Duration::from_secs(self.engine.recompute_interval_secs.max(1))
    }

    pub fn optimize_interval(&self) -> Duration {
        Duration::from_secs(self.engine.optimize_interval_secs.max(1))
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.cycle_timeout_secs.max(1))
    }

    /// Builder for tests and the replay tool to register an event
    pub fn with_event(mut self, id: &str, venue_type: VenueType) -> Self {
        self.events.push(EventConfig {
            id: id.to_string(),
            venue_type,
            capacity: None,
            thresholds: ThresholdOverrides::default(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "venue");
        assert_eq!(config.engine().learning_window_hours, 4);
        assert_eq!(config.learning_window(), chrono::Duration::hours(4));
        assert_eq!(config.binding_policy().evidence_weight, 0.05);
        assert_eq!(config.merge_policy().auto_approve_confidence, 0.85);
        assert_eq!(config.optimizer_policy().min_decisions, 5);
        assert!(!config.mqtt().enabled);
        assert!(config.events().is_empty());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[binding]
evidence_weight = 0.1

[[events]]
id = "fest"
venue_type = "festival"
"#,
        )
        .unwrap();
        assert_eq!(toml_config.binding.evidence_weight, 0.1);
        assert_eq!(toml_config.binding.max_violations, 100);
        assert_eq!(toml_config.events[0].venue_type, VenueType::Festival);
        let t = toml_config.events[0].initial_thresholds().unwrap();
        assert_eq!(t.duplicate_distance_meters, 30.0);
    }

    #[test]
    fn test_with_event_builder() {
        let config = Config::default().with_event("ev", VenueType::Club);
        assert_eq!(config.events().len(), 1);
        assert_eq!(config.events()[0].event_id(), EventId::from("ev"));
    }
}
