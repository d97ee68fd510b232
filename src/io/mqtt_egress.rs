//! MQTT publisher for recorded decisions
//!
//! Decisions are handed over through a bounded channel so a slow or absent
//! broker never stalls the scheduler; when the channel is full the decision
//! is dropped from the live stream (it is still in the audit log).

use crate::domain::decision::DecisionExplanation;
use crate::infra::config::MqttConfig;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Wire form of a published decision
#[derive(Debug, Serialize)]
pub struct DecisionPayload {
    pub site: String,
    #[serde(flatten)]
    pub decision: DecisionExplanation,
}

/// Non-blocking sending half of the decision channel
#[derive(Clone)]
pub struct DecisionSender {
    tx: mpsc::Sender<DecisionPayload>,
    site: Arc<String>,
    dropped: Arc<AtomicU64>,
}

impl DecisionSender {
    pub fn send(&self, decision: DecisionExplanation) {
        let payload = DecisionPayload { site: self.site.to_string(), decision };
        match self.tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(p)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(decision_id = %p.decision.id, dropped = %dropped, "decision_egress_dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn send_all(&self, decisions: &[DecisionExplanation]) {
        for decision in decisions {
            self.send(decision.clone());
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn create_decision_channel(capacity: usize, site: String) -> (DecisionSender, mpsc::Receiver<DecisionPayload>) {
    let (tx, rx) = mpsc::channel(capacity);
    (DecisionSender { tx, site: Arc::new(site), dropped: Arc::new(AtomicU64::new(0)) }, rx)
}

/// MQTT publisher actor
pub struct DecisionPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<DecisionPayload>,
    topic: String,
}

impl DecisionPublisher {
    /// Connects to the configured broker; the eventloop runs on its own task
    pub fn new(config: &MqttConfig, rx: mpsc::Receiver<DecisionPayload>) -> Self {
        let client_id = format!("gate-discovery-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, &config.host, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, topic: config.decisions_topic.clone() }
    }

    /// Publish until shutdown, then drain what is already queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(topic = %self.topic, "mqtt_egress_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(payload) = self.rx.try_recv() {
                            self.publish(payload).await;
                        }
                        return;
                    }
                }
                Some(payload) = self.rx.recv() => {
                    self.publish(payload).await;
                }
            }
        }
    }

    async fn publish(&self, payload: DecisionPayload) {
        let json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "mqtt_egress_serialize_failed");
                return;
            }
        };
        // QoS 1: decisions are part of the audit trail
        if let Err(e) = self.client.publish(&self.topic, QoS::AtLeastOnce, false, json.into_bytes()).await {
            error!(error = %e, "mqtt_egress_decision_failed");
        }
    }
}
