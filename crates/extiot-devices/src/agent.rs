//! Device agent.
//!
//! The device-side process: announces itself, reports status on a schedule,
//! and applies whatever the server sends on its config topic.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use extiot_core::config::defaults;
use extiot_core::{
    DeviceIdentity, DeviceKey, DeviceProfile, Envelope, Error, MessageType, Payload, QoS, Result,
    TopicScheme,
};

use crate::scheduler::{
    requested_interval, ReportScheduler, Reporter, ScheduleState, SchedulerConfig,
};
use crate::sensor::StatusSource;
use crate::transport::{Delivery, Transport};

const CONFIG_UPDATE_CAPACITY: usize = 16;

/// Effect of applying a config payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOutcome {
    /// The reporting task was restarted at this interval.
    Rescheduled(Duration),
    /// The payload named the interval already in effect.
    Unchanged,
    /// No interval in the payload; only forwarded to listeners.
    Forwarded,
}

/// What the agent did with one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    Registered {
        device_id: DeviceIdentity,
        config: ConfigOutcome,
    },
    ConfigApplied(ConfigOutcome),
    /// The server asked for registration again. The rest of its payload
    /// was applied like any other config.
    Reannounced(ConfigOutcome),
    Ignored,
}

pub struct DeviceAgent {
    key: DeviceKey,
    topics: TopicScheme,
    transport: Arc<dyn Transport>,
    reporter: Arc<Reporter>,
    scheduler: Mutex<ReportScheduler>,
    identity: watch::Sender<Option<DeviceIdentity>>,
    config_updates: broadcast::Sender<Payload>,
    initial_interval: Duration,
}

impl DeviceAgent {
    pub fn new(
        profile: DeviceProfile,
        transport: Arc<dyn Transport>,
        sensor: Arc<dyn StatusSource>,
        topics: TopicScheme,
        config: SchedulerConfig,
    ) -> Self {
        let key = profile.key();
        let (identity, identity_rx) = watch::channel(None);
        let (config_updates, _) = broadcast::channel(CONFIG_UPDATE_CAPACITY);
        let reporter = Arc::new(Reporter::new(
            profile,
            topics.clone(),
            transport.clone(),
            sensor,
            identity_rx,
            &config,
        ));

        Self {
            key,
            topics,
            transport,
            scheduler: Mutex::new(ReportScheduler::new(reporter.clone())),
            reporter,
            identity,
            config_updates,
            initial_interval: config.initial_interval,
        }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        *self.identity.borrow()
    }

    /// Follow identity assignment.
    pub fn identity_watch(&self) -> watch::Receiver<Option<DeviceIdentity>> {
        self.identity.subscribe()
    }

    /// Every config payload the agent receives, forwarded untouched.
    pub fn config_updates(&self) -> broadcast::Receiver<Payload> {
        self.config_updates.subscribe()
    }

    pub fn schedule_state(&self) -> ScheduleState {
        self.scheduler.lock().state()
    }

    /// Subscribe to the config topic, announce, and start reporting.
    pub async fn start(&self) -> Result<()> {
        self.transport
            .subscribe(&self.topics.config(&self.key), QoS::AtLeastOnce)
            .await?;
        if let Err(e) = self.reporter.announce().await {
            // Periodic re-announce covers a lost first attempt.
            warn!(device = %self.key, "Initial announce failed: {}", e);
        }
        self.scheduler.lock().set_interval(self.initial_interval)?;
        info!(device = %self.key, interval = ?self.initial_interval, "Device agent started");
        Ok(())
    }

    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<AgentEvent> {
        let envelope = Envelope::decode(&delivery.payload)?;
        self.handle(envelope).await
    }

    /// Apply one envelope received on the config topic.
    pub async fn handle(&self, envelope: Envelope) -> Result<AgentEvent> {
        let target = envelope.key();
        if target != self.key {
            return Err(Error::ProtocolViolation(format!(
                "{} addressed to {}, this device is {}",
                envelope.message_type, target, self.key
            )));
        }

        match &envelope.message_type {
            MessageType::RegisterAck => {
                let device_id = envelope.identity().ok_or_else(|| {
                    Error::ProtocolViolation("RegisterAck without a DeviceID".into())
                })?;
                let previous = self.identity.send_replace(Some(device_id));
                if previous != Some(device_id) {
                    info!(device = %self.key, device_id = %device_id, "Identity assigned");
                }
                let config = self.apply_config(&envelope.payload)?;
                Ok(AgentEvent::Registered { device_id, config })
            }
            MessageType::Config => {
                let config = self.apply_config(&envelope.payload);
                if wants_reregister(&envelope.payload) {
                    self.identity.send_replace(None);
                    self.reporter.announce().await?;
                    return Ok(AgentEvent::Reannounced(config?));
                }
                Ok(AgentEvent::ConfigApplied(config?))
            }
            MessageType::Register | MessageType::Status | MessageType::Disconnect => {
                Err(Error::ProtocolViolation(format!(
                    "{} is only sent to the server",
                    envelope.message_type
                )))
            }
            MessageType::Unknown(name) => {
                debug!(device = %self.key, message_type = %name, "Ignoring unknown message type");
                Ok(AgentEvent::Ignored)
            }
        }
    }

    /// Forward a config payload and reschedule if it names an interval.
    pub fn apply_config(&self, payload: &Payload) -> Result<ConfigOutcome> {
        // No subscribers is fine.
        let _ = self.config_updates.send(payload.clone());

        match requested_interval(payload) {
            None => Ok(ConfigOutcome::Forwarded),
            Some(interval) => {
                let interval = interval?;
                if self.scheduler.lock().set_interval(interval)? {
                    Ok(ConfigOutcome::Rescheduled(interval))
                } else {
                    Ok(ConfigOutcome::Unchanged)
                }
            }
        }
    }

    /// Start, then handle deliveries until `shutdown` fires or the channel
    /// closes. Sends a best-effort Disconnect on the way out.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Delivery>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.start().await?;

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                delivery = inbound.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            match self.handle_delivery(&delivery).await {
                Ok(event) => debug!(device = %self.key, ?event, "Handled delivery"),
                Err(e) => warn!(
                    device = %self.key,
                    topic = %delivery.topic,
                    kind = e.kind(),
                    "Failed to handle delivery: {}",
                    e
                ),
            }
        }

        self.scheduler.lock().stop();
        if let Err(e) = self.reporter.disconnect().await {
            debug!(device = %self.key, "Disconnect not sent: {}", e);
        }
        info!(device = %self.key, "Device agent stopped");
        Ok(())
    }
}

fn wants_reregister(payload: &Payload) -> bool {
    payload
        .get(defaults::REREGISTER_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SimulatedSensor;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn profile() -> DeviceProfile {
        DeviceProfile {
            product_type: "thermo".into(),
            product_id: "P1".into(),
            serial_number: "SN001".into(),
            mac: "00:11:22:33:44:55".into(),
        }
    }

    fn agent() -> (DeviceAgent, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let agent = DeviceAgent::new(
            profile(),
            transport.clone(),
            Arc::new(SimulatedSensor::default()),
            TopicScheme::default(),
            SchedulerConfig::default(),
        );
        (agent, transport)
    }

    fn config(payload: Value) -> Envelope {
        let payload = payload.as_object().cloned().unwrap();
        Envelope::new(MessageType::Config, &DeviceKey::new("P1", "SN001")).with_payload(payload)
    }

    #[tokio::test]
    async fn test_start_subscribes_and_announces() {
        let (agent, transport) = agent();
        agent.start().await.unwrap();

        assert_eq!(
            transport.subscriptions(),
            vec![("extiot/device/config/P1_SN001".to_string(), QoS::AtLeastOnce)]
        );
        let sent = transport.published_on("extiot/device/status/P1_SN001");
        assert_eq!(sent.len(), 1);
        let register = Envelope::decode(&sent[0].payload).unwrap();
        assert_eq!(register.message_type, MessageType::Register);
        assert_eq!(register.product_type, "thermo");
        assert_eq!(register.device_id, None);
        assert_eq!(
            agent.schedule_state(),
            ScheduleState::Running {
                interval: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test]
    async fn test_register_ack_assigns_identity() {
        let (agent, _) = agent();
        let mut identity = agent.identity_watch();
        let ack = Envelope::new(MessageType::RegisterAck, agent.key())
            .with_device_id(DeviceIdentity::new(42));

        let event = agent.handle(ack).await.unwrap();
        assert_eq!(
            event,
            AgentEvent::Registered {
                device_id: DeviceIdentity::new(42),
                config: ConfigOutcome::Forwarded,
            }
        );
        assert!(identity.has_changed().unwrap());
        assert_eq!(*identity.borrow_and_update(), Some(DeviceIdentity::new(42)));
    }

    #[tokio::test]
    async fn test_config_forwarded_untouched() {
        let (agent, _) = agent();
        let mut updates = agent.config_updates();

        let event = agent
            .handle(config(json!({"interval": 10, "led": "on"})))
            .await
            .unwrap();
        assert_eq!(
            event,
            AgentEvent::ConfigApplied(ConfigOutcome::Rescheduled(Duration::from_secs(10)))
        );
        let forwarded = updates.recv().await.unwrap();
        assert_eq!(forwarded.get("led"), Some(&json!("on")));
        assert_eq!(forwarded.get("interval"), Some(&json!(10)));

        let event = agent.handle(config(json!({"interval": 10}))).await.unwrap();
        assert_eq!(event, AgentEvent::ConfigApplied(ConfigOutcome::Unchanged));
    }

    #[tokio::test]
    async fn test_invalid_interval_keeps_schedule() {
        let (agent, _) = agent();
        agent.start().await.unwrap();

        let err = agent
            .handle(config(json!({"interval": "fast"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_interval");
        assert_eq!(
            agent.schedule_state(),
            ScheduleState::Running {
                interval: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test]
    async fn test_out_of_range_interval_keeps_schedule() {
        let (agent, _) = agent();
        agent.start().await.unwrap();

        for interval in [json!(u64::MAX), json!(1e300), json!(8 * 24 * 60 * 60)] {
            let err = agent
                .handle(config(json!({ "interval": interval })))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_interval");
        }
        assert_eq!(
            agent.schedule_state(),
            ScheduleState::Running {
                interval: Duration::from_secs(5)
            }
        );

        let err = agent
            .scheduler
            .lock()
            .set_interval(Duration::from_secs(u64::MAX))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_interval");
        assert_eq!(
            agent.schedule_state(),
            ScheduleState::Running {
                interval: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test]
    async fn test_reregister_prompt_keeps_other_settings() {
        let (agent, transport) = agent();
        agent.start().await.unwrap();
        let mut updates = agent.config_updates();

        let event = agent
            .handle(config(json!({"reregister": true, "led": "on", "interval": 30})))
            .await
            .unwrap();
        assert_eq!(
            event,
            AgentEvent::Reannounced(ConfigOutcome::Rescheduled(Duration::from_secs(30)))
        );

        let forwarded = updates.recv().await.unwrap();
        assert_eq!(forwarded.get("led"), Some(&json!("on")));
        assert_eq!(forwarded.get("reregister"), Some(&json!(true)));
        assert_eq!(
            agent.schedule_state(),
            ScheduleState::Running {
                interval: Duration::from_secs(30)
            }
        );
        // One announce from start, one for the prompt.
        assert_eq!(
            transport.published_on("extiot/device/status/P1_SN001").len(),
            2
        );
    }

    #[tokio::test]
    async fn test_reregister_prompt_reannounces() {
        let (agent, transport) = agent();
        agent
            .handle(
                Envelope::new(MessageType::RegisterAck, agent.key())
                    .with_device_id(DeviceIdentity::new(7)),
            )
            .await
            .unwrap();

        let event = agent
            .handle(config(json!({"reregister": true})))
            .await
            .unwrap();
        assert_eq!(event, AgentEvent::Reannounced(ConfigOutcome::Forwarded));
        assert_eq!(agent.identity(), None);
        assert_eq!(
            transport.published_on("extiot/device/status/P1_SN001").len(),
            1
        );
    }

    #[tokio::test]
    async fn test_rejects_foreign_and_server_bound_envelopes() {
        let (agent, _) = agent();

        let foreign = Envelope::new(MessageType::Config, &DeviceKey::new("P1", "SN999"));
        assert_eq!(
            agent.handle(foreign).await.unwrap_err().kind(),
            "protocol_violation"
        );

        let status = Envelope::new(MessageType::Status, agent.key());
        assert_eq!(
            agent.handle(status).await.unwrap_err().kind(),
            "protocol_violation"
        );

        let ack_without_id = Envelope::new(MessageType::RegisterAck, agent.key());
        assert_eq!(
            agent.handle(ack_without_id).await.unwrap_err().kind(),
            "protocol_violation"
        );
    }
}
