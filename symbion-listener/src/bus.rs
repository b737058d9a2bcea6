/**
 * MESSAGE BUS - Abonnements MQTT pour le listener
 *
 * ROLE: expose les topics DEA (heartbeat, advertise) comme des flux de payloads
 * bruts. Livraison at-least-once, sans ordre garanti, un message = un payload.
 *
 * ARCHITECTURE: un seul AsyncClient rumqttc partagé; l'event loop tourne dans
 * sa propre task et route chaque Publish vers les abonnés du topic exact.
 * Les abonnements sont rejoués à chaque ConnAck (reconnexion broker).
 */

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Flux des payloads reçus sur un topic
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { topic: topic.into(), rx }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// None quand le bus a été fermé
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

type Routes = Shared<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>;

pub struct MqttBus {
    client: AsyncClient,
    routes: Routes,
}

impl MqttBus {
    /// Crée le client et démarre l'event loop en tâche de fond
    pub fn connect(cfg: &MqttConf, health: HealthTracker) -> Self {
        let client_id = cfg
            .client_id
            .clone()
            .unwrap_or_else(|| format!("symbion-listener-{}", Uuid::new_v4()));
        let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));

        let (client, eventloop) = AsyncClient::new(opts, 64);
        let routes: Routes = new_state(HashMap::new());

        info!(host = %cfg.host, port = cfg.port, "connecting to MQTT broker");
        task::spawn(run_event_loop(eventloop, client.clone(), routes.clone(), health));

        Self { client, routes }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().entry(topic.to_string()).or_default().push(tx);
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        info!(topic, "subscribed");
        Ok(Subscription::new(topic, rx))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client.publish(topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

async fn run_event_loop(mut eventloop: EventLoop, client: AsyncClient, routes: Routes, health: HealthTracker) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                health.mark_mqtt_connected();
                let topics: Vec<String> = routes.lock().keys().cloned().collect();
                for topic in topics {
                    // try_subscribe: l'event loop ne doit pas attendre sur son propre canal
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!(topic = %topic, error = %e, "resubscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                let delivered = dispatch(&routes, &p.topic, p.payload.to_vec());
                if !delivered {
                    debug!(topic = %p.topic, "message without subscriber");
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = ?e, "MQTT error");
                health.increment_reconnects();
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Route un payload vers les abonnés du topic; retire les abonnés fermés
fn dispatch(routes: &Routes, topic: &str, payload: Vec<u8>) -> bool {
    let mut routes = routes.lock();
    let Some(senders) = routes.get_mut(topic) else {
        return false;
    };
    senders.retain(|tx| tx.send(payload.clone()).is_ok());
    !senders.is_empty()
}
