//! IO modules - external system interfaces
//!
//! - `feed` - `CheckinSource` trait, in-memory feed, JSONL loading
//! - `mqtt` - MQTT client ingesting check-ins into the feed
//! - `mqtt_egress` - MQTT publisher for recorded decisions
//! - `audit_log` - append-only JSONL decision audit file and the decision fan-out
//! - `http` - JSON read model, trigger paths and `/metrics`
//! - `prometheus` - Prometheus text exposition

pub mod audit_log;
pub mod feed;
pub mod http;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;

// Re-export commonly used types
pub use audit_log::{AuditLog, DecisionSink};
pub use feed::{load_jsonl, CheckinSource, MemoryFeed};
pub use http::{start_http_server, HttpState};
pub use mqtt::start_checkin_ingest;
pub use mqtt_egress::{create_decision_channel, DecisionPublisher, DecisionSender};
