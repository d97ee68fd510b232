//! MQTT ingest of check-in events into the in-memory feed
//!
//! Payloads are JSON: either one check-in object or an array of them.
//! Malformed payloads are counted and dropped; the feed only ever grows by
//! well-formed, previously unseen check-ins.

use crate::domain::types::CheckinEvent;
use crate::infra::config::MqttConfig;
use crate::infra::metrics::Metrics;
use crate::io::feed::MemoryFeed;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Deserialize)]
#[serde(untagged)]
enum CheckinPayload {
    Batch(Vec<CheckinEvent>),
    Single(Box<CheckinEvent>),
}

/// Parse an MQTT payload into check-ins
pub fn parse_payload(payload: &[u8]) -> anyhow::Result<Vec<CheckinEvent>> {
    let json = std::str::from_utf8(payload)?;
    Ok(match serde_json::from_str::<CheckinPayload>(json)? {
        CheckinPayload::Batch(checkins) => checkins,
        CheckinPayload::Single(checkin) => vec![*checkin],
    })
}

/// Subscribe to the check-in topic and append every parsed check-in to `feed`
pub async fn start_checkin_ingest(
    config: &MqttConfig,
    feed: Arc<MemoryFeed>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client_id = format!("gate-discovery-ingest-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, &config.host, config.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(&config.checkins_topic, QoS::AtLeastOnce).await?;

    info!(topic = %config.checkins_topic, host = %config.host, port = %config.port, "mqtt_ingest_subscribed");

    // Rate-limit malformed-payload warnings to 1 per second
    let mut last_malformed_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_ingest_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match parse_payload(&publish.payload) {
                            Ok(checkins) => {
                                let received = checkins.len();
                                for checkin in checkins {
                                    if feed.push(checkin) {
                                        metrics.record_checkin_ingested();
                                    }
                                }
                                debug!(topic = %publish.topic, checkins = %received, "mqtt_checkins_received");
                            }
                            Err(e) => {
                                metrics.record_checkin_malformed();
                                if last_malformed_warn.elapsed() > Duration::from_secs(1) {
                                    warn!(topic = %publish.topic, error = %e, "mqtt_payload_malformed");
                                    last_malformed_warn = Instant::now();
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_ingest_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_ingest_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"{
        "id": "c-1",
        "event_id": "ev-1",
        "wristband_id": "w-1",
        "timestamp": "2026-07-04T18:00:00Z",
        "category": "GA",
        "location": {"latitude": 40.7505, "longitude": -73.9934, "accuracy_m": 6.0},
        "signals": {"wifi_ssids": ["venue-north"]},
        "status": "success",
        "processing_latency_ms": 420
    }"#;

    #[test]
    fn test_parse_single_checkin() {
        let checkins = parse_payload(SINGLE.as_bytes()).unwrap();
        assert_eq!(checkins.len(), 1);
        let c = &checkins[0];
        assert_eq!(c.id.as_str(), "c-1");
        assert_eq!(c.processing_latency_ms, Some(420));
        assert_eq!(c.signals.wifi_ssids, vec!["venue-north".to_string()]);
        assert!(c.signals.ble_beacons.is_empty());
    }

    #[test]
    fn test_parse_batch() {
        let batch = format!("[{SINGLE}, {}]", SINGLE.replace("c-1", "c-2"));
        let checkins = parse_payload(batch.as_bytes()).unwrap();
        assert_eq!(checkins.len(), 2);
        assert_eq!(checkins[1].id.as_str(), "c-2");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_payload(b"not json").is_err());
        assert!(parse_payload(&[0xff, 0xfe]).is_err());
        // Missing required fields
        assert!(parse_payload(br#"{"id":"c-1"}"#).is_err());
    }
}
