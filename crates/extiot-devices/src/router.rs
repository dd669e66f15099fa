//! Server-side message router.
//!
//! Consumes transport deliveries from a bounded channel and dispatches each
//! decoded envelope by message type. A failing message is logged with its
//! type and device key; the loop keeps going.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use extiot_core::config::defaults;
use extiot_core::{
    DeviceIdentity, DeviceKey, Envelope, Error, MessageType, Payload, QoS, Result, TopicScheme,
};

use crate::registry::DeviceRegistry;
use crate::transport::{publish_within, Delivery, Transport};

/// What the router did with one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Registered {
        device_id: DeviceIdentity,
        created: bool,
    },
    StatusRecorded,
    MarkedOffline,
    /// Unknown message type, dropped.
    Unhandled,
}

/// Best-effort connection state, kept in memory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online { since: DateTime<Utc> },
    Offline { since: DateTime<Utc> },
}

impl Presence {
    pub fn is_online(&self) -> bool {
        matches!(self, Presence::Online { .. })
    }
}

/// Counters reported when the router loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub handled: u64,
    pub failed: u64,
}

pub struct MessageRouter {
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn Transport>,
    topics: TopicScheme,
    presence: Mutex<HashMap<DeviceKey, Presence>>,
    handled: AtomicU64,
    failed: AtomicU64,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        transport: Arc<dyn Transport>,
        topics: TopicScheme,
    ) -> Self {
        Self {
            registry,
            transport,
            topics,
            presence: Mutex::new(HashMap::new()),
            handled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Dispatch one decoded envelope.
    pub async fn route(&self, envelope: Envelope) -> Result<RouteOutcome> {
        let key = envelope.key();
        match &envelope.message_type {
            MessageType::Register => {
                let registration = self
                    .registry
                    .register(&key, &envelope.product_type, &envelope.mac)
                    .await?;
                self.set_presence(&key, true);

                let ack = Envelope::new(MessageType::RegisterAck, &key)
                    .with_product_type(envelope.product_type.clone())
                    .with_mac(envelope.mac.clone())
                    .with_device_id(registration.device_id)
                    .with_payload(registration.config);
                self.publish(&self.topics.config(&key), ack).await?;

                Ok(RouteOutcome::Registered {
                    device_id: registration.device_id,
                    created: registration.created,
                })
            }
            MessageType::Status => match self.registry.record_status(&key, &envelope.payload).await
            {
                Ok(()) => {
                    self.set_presence(&key, true);
                    Ok(RouteOutcome::StatusRecorded)
                }
                Err(Error::NotFound(missing)) => {
                    if self.registry.config().prompt_reregister {
                        if let Err(e) = self.prompt_reregister(&key).await {
                            warn!(device = %key, "Failed to prompt re-registration: {}", e);
                        }
                    }
                    Err(Error::NotFound(missing))
                }
                Err(e) => Err(e),
            },
            MessageType::Disconnect => {
                self.set_presence(&key, false);
                info!(device = %key, "Device disconnected");
                Ok(RouteOutcome::MarkedOffline)
            }
            MessageType::Config | MessageType::RegisterAck => Err(Error::ProtocolViolation(
                format!("{} is only sent to devices", envelope.message_type),
            )),
            MessageType::Unknown(name) => {
                debug!(device = %key, message_type = %name, "Unhandled message type, dropping");
                Ok(RouteOutcome::Unhandled)
            }
        }
    }

    /// Decode and route one delivery, logging any failure.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<RouteOutcome> {
        let envelope = match Envelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %delivery.topic, kind = e.kind(), "Dropping delivery: {}", e);
                return Err(e);
            }
        };

        let message_type = envelope.message_type.clone();
        let key = envelope.key();
        match self.route(envelope).await {
            Ok(outcome) => {
                self.handled.fetch_add(1, Ordering::Relaxed);
                debug!(message_type = %message_type, device = %key, ?outcome, "Routed message");
                Ok(outcome)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_type = %message_type,
                    device = %key,
                    kind = e.kind(),
                    "Failed to handle message: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Consume deliveries until the channel closes or `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Delivery>,
        shutdown: CancellationToken,
    ) -> RouterStats {
        info!("Message router started");
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                delivery = inbound.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            let _ = self.handle_delivery(&delivery).await;
        }

        let stats = self.stats();
        info!(handled = stats.handled, failed = stats.failed, "Message router stopped");
        stats
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn presence(&self, key: &DeviceKey) -> Option<Presence> {
        self.presence.lock().get(key).copied()
    }

    pub fn online_count(&self) -> usize {
        self.presence
            .lock()
            .values()
            .filter(|p| p.is_online())
            .count()
    }

    fn set_presence(&self, key: &DeviceKey, online: bool) {
        let mut presence = self.presence.lock();
        let current = presence.get(key).map(Presence::is_online);
        if current != Some(online) {
            let since = Utc::now();
            let state = if online {
                Presence::Online { since }
            } else {
                Presence::Offline { since }
            };
            presence.insert(key.clone(), state);
        }
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        publish_within(
            self.transport.as_ref(),
            self.registry.config().publish_timeout,
            topic,
            QoS::AtLeastOnce,
            envelope.encode(),
        )
        .await
    }

    async fn prompt_reregister(&self, key: &DeviceKey) -> Result<()> {
        let mut payload = Payload::new();
        payload.insert(defaults::REREGISTER_FIELD.to_string(), Value::Bool(true));
        let prompt = Envelope::new(MessageType::Config, key).with_payload(payload);
        self.publish(&self.topics.config(key), prompt).await?;
        info!(device = %key, "Asked unregistered device to register");
        Ok(())
    }
}
