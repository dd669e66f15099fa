//! MQTT transport over `rumqttc`.
//!
//! A single broker connection: the event loop runs on its own task, forwards
//! every incoming publish into the bounded delivery queue, and restores
//! subscriptions after a reconnect that lost the session.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use extiot_core::{Error, MqttConfig, QoS, Result};

use crate::transport::{Delivery, Transport};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Transport backed by one MQTT broker connection.
pub struct MqttTransport {
    client: AsyncClient,
    broker_addr: String,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
}

impl MqttTransport {
    /// Create the client and spawn its event loop.
    ///
    /// The loop stops when `shutdown` is cancelled or the returned receiver is
    /// dropped.
    pub fn connect(
        config: &MqttConfig,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Delivery>) {
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive));
        options.set_clean_session(config.clean_session);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        let subscriptions = Arc::new(Mutex::new(Vec::new()));

        let transport = Arc::new(Self {
            client: client.clone(),
            broker_addr: config.full_broker_addr(),
            subscriptions: subscriptions.clone(),
        });

        tokio::spawn(run_event_loop(
            eventloop,
            client,
            tx,
            subscriptions,
            transport.broker_addr.clone(),
            shutdown,
        ));

        info!(broker = %transport.broker_addr, client_id = %config.client_id, "MQTT transport started");
        (transport, rx)
    }

    pub fn broker_addr(&self) -> &str {
        &self.broker_addr
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

async fn run_event_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    tx: mpsc::Sender<Delivery>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    broker_addr: String,
    shutdown: CancellationToken,
) {
    let mut connected_before = false;
    let mut backoff = Duration::from_secs(1);

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let delivery = Delivery::new(publish.topic.clone(), publish.payload.to_vec());
                if tx.send(delivery).await.is_err() {
                    debug!(broker = %broker_addr, "Delivery queue closed, stopping MQTT event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                backoff = Duration::from_secs(1);
                info!(broker = %broker_addr, session_present = ack.session_present, "MQTT connection acknowledged");
                if connected_before && !ack.session_present {
                    // Requests queued by `subscribe` were consumed by the old
                    // session; replay them without blocking the poller.
                    let filters = subscriptions.lock().clone();
                    for (filter, qos) in filters {
                        if let Err(e) = client.try_subscribe(&filter, to_mqtt_qos(qos)) {
                            warn!(broker = %broker_addr, filter = %filter, "Failed to resubscribe: {}", e);
                        }
                    }
                }
                connected_before = true;
            }
            Ok(_) => {}
            Err(e) => {
                error!(broker = %broker_addr, "MQTT connection error: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    info!(broker = %broker_addr, "MQTT event loop stopped");
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, to_mqtt_qos(qos), false, payload)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.client
            .subscribe(filter, to_mqtt_qos(qos))
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.iter().any(|(f, _)| f == filter) {
            subscriptions.push((filter.to_string(), qos));
        }
        Ok(())
    }
}
