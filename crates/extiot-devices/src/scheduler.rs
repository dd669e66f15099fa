//! Adaptive reporting scheduler (device side).
//!
//! One periodic task per device publishes a status report every interval.
//! Changing the interval cancels the running task through its token and
//! starts a fresh one; a tick that is already publishing finishes, but the
//! old task never ticks again.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use extiot_core::config::defaults;
use extiot_core::{
    DeviceIdentity, DeviceProfile, Envelope, Error, MessageType, Payload, QoS, Result, TopicScheme,
};

use crate::sensor::StatusSource;
use crate::transport::{publish_within, Transport};

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval used until the server sends another one.
    pub initial_interval: Duration,
    /// Bound on each publish; a report that takes longer is dropped.
    pub publish_timeout: Duration,
    /// QoS for periodic status reports.
    pub qos: QoS,
    /// Re-send Register every this many ticks while unregistered. Zero disables.
    pub reannounce_every: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(defaults::REPORT_INTERVAL_SECS),
            publish_timeout: Duration::from_secs(defaults::PUBLISH_TIMEOUT_SECS),
            qos: QoS::AtMostOnce,
            reannounce_every: defaults::REANNOUNCE_EVERY_TICKS,
        }
    }
}

/// Builds and publishes this device's outbound envelopes.
pub struct Reporter {
    profile: DeviceProfile,
    topics: TopicScheme,
    transport: Arc<dyn Transport>,
    sensor: Arc<dyn StatusSource>,
    identity: watch::Receiver<Option<DeviceIdentity>>,
    publish_timeout: Duration,
    qos: QoS,
    reannounce_every: u32,
}

impl Reporter {
    pub fn new(
        profile: DeviceProfile,
        topics: TopicScheme,
        transport: Arc<dyn Transport>,
        sensor: Arc<dyn StatusSource>,
        identity: watch::Receiver<Option<DeviceIdentity>>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            profile,
            topics,
            transport,
            sensor,
            identity,
            publish_timeout: config.publish_timeout,
            qos: config.qos,
            reannounce_every: config.reannounce_every,
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        *self.identity.borrow()
    }

    fn envelope(&self, message_type: MessageType) -> Envelope {
        let mut envelope = Envelope::new(message_type, &self.profile.key())
            .with_product_type(self.profile.product_type.clone())
            .with_mac(self.profile.mac.clone());
        if let Some(id) = self.identity() {
            envelope = envelope.with_device_id(id);
        }
        envelope
    }

    /// A status envelope carrying a fresh sensor sample.
    pub fn status_envelope(&self) -> Envelope {
        self.envelope(MessageType::Status)
            .with_payload(self.sensor.sample())
    }

    /// Publish a Register envelope on the status topic.
    pub async fn announce(&self) -> Result<()> {
        let envelope = self.envelope(MessageType::Register);
        let topic = self.topics.status(&self.profile.key());
        self.publish(&topic, QoS::AtLeastOnce, envelope.encode())
            .await?;
        info!(device = %self.profile.key(), "Announced registration");
        Ok(())
    }

    /// Publish a Disconnect envelope on the status topic.
    pub async fn disconnect(&self) -> Result<()> {
        let envelope = self.envelope(MessageType::Disconnect);
        let topic = self.topics.status(&self.profile.key());
        self.publish(&topic, QoS::AtLeastOnce, envelope.encode())
            .await
    }

    /// One scheduler tick: publish a status report, and re-announce every
    /// few ticks while no identity has been assigned.
    pub async fn report(&self, tick: u64) -> Result<()> {
        if self.identity().is_none()
            && self.reannounce_every > 0
            && tick % u64::from(self.reannounce_every) == 0
        {
            if let Err(e) = self.announce().await {
                warn!(device = %self.profile.key(), tick, "Re-announce failed: {}", e);
            }
        }

        let envelope = self.status_envelope();
        let topic = self.topics.data(&self.profile.key());
        self.publish(&topic, self.qos, envelope.encode()).await?;
        debug!(device = %self.profile.key(), tick, "Status reported");
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        publish_within(
            self.transport.as_ref(),
            self.publish_timeout,
            topic,
            qos,
            payload,
        )
        .await
    }
}

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Idle,
    Running { interval: Duration },
}

struct RunningTask {
    interval: Duration,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns at most one periodic reporting task.
pub struct ReportScheduler {
    reporter: Arc<Reporter>,
    running: Option<RunningTask>,
}

impl ReportScheduler {
    pub fn new(reporter: Arc<Reporter>) -> Self {
        Self {
            reporter,
            running: None,
        }
    }

    pub fn state(&self) -> ScheduleState {
        match &self.running {
            Some(task) => ScheduleState::Running {
                interval: task.interval,
            },
            None => ScheduleState::Idle,
        }
    }

    /// Start reporting at `interval`, replacing any running task.
    ///
    /// Returns `false` when already running at that interval. The first tick
    /// of a new task is due one full interval after this call. Must be called
    /// within a Tokio runtime.
    pub fn set_interval(&mut self, interval: Duration) -> Result<bool> {
        if interval.is_zero() {
            return Err(Error::InvalidInterval(
                "reporting interval must be positive".into(),
            ));
        }
        if interval > Duration::from_secs(defaults::MAX_REPORT_INTERVAL_SECS) {
            return Err(Error::InvalidInterval(format!(
                "reporting interval {:?} exceeds {} seconds",
                interval,
                defaults::MAX_REPORT_INTERVAL_SECS
            )));
        }
        if let Some(task) = &self.running {
            if task.interval == interval {
                return Ok(false);
            }
        }

        let first_tick = Instant::now().checked_add(interval).ok_or_else(|| {
            Error::InvalidInterval(format!("reporting interval {:?} is out of range", interval))
        })?;
        let previous = self.running.take().map(|task| {
            task.token.cancel();
            task.interval
        });

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_periodic(
            self.reporter.clone(),
            first_tick,
            interval,
            token.clone(),
        ));
        self.running = Some(RunningTask {
            interval,
            token,
            handle,
        });

        match previous {
            Some(old) => info!(from = ?old, to = ?interval, "Reporting interval changed"),
            None => info!(interval = ?interval, "Reporting started"),
        }
        Ok(true)
    }

    /// Cancel the running task, if any.
    pub fn stop(&mut self) {
        if let Some(task) = self.running.take() {
            task.token.cancel();
            debug!(interval = ?task.interval, "Reporting stopped");
        }
    }

    /// Cancel the running task and wait for its in-flight tick to finish.
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.running.take() {
            task.token.cancel();
            let _ = task.handle.await;
        }
    }
}

impl Drop for ReportScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_periodic(
    reporter: Arc<Reporter>,
    first_tick: Instant,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tick += 1;
        if let Err(e) = reporter.report(tick).await {
            warn!(
                device = %reporter.profile().key(),
                tick,
                kind = e.kind(),
                "Status report dropped: {}",
                e
            );
        }
    }

    debug!(device = %reporter.profile().key(), period = ?period, ticks = tick, "Reporting task exited");
}

/// Extract a reporting interval from a config payload.
///
/// `None` when the payload has no interval field. A present field must be a
/// whole number of seconds, at least one and at most a week.
pub fn requested_interval(payload: &Payload) -> Option<Result<Duration>> {
    let value = payload.get(defaults::INTERVAL_FIELD)?;
    Some(parse_interval(value))
}

fn parse_interval(value: &Value) -> Result<Duration> {
    let secs = match value.as_u64() {
        Some(secs) => Some(secs),
        None => value
            .as_f64()
            .filter(|secs| secs.fract() == 0.0 && *secs >= 0.0 && *secs <= MAX_SECS_F64)
            .map(|secs| secs as u64),
    };
    match secs {
        Some(secs) if secs > 0 && secs <= defaults::MAX_REPORT_INTERVAL_SECS => {
            Ok(Duration::from_secs(secs))
        }
        _ => Err(Error::InvalidInterval(format!(
            "expected a whole number of seconds between 1 and {}, got {}",
            defaults::MAX_REPORT_INTERVAL_SECS,
            value
        ))),
    }
}

const MAX_SECS_F64: f64 = defaults::MAX_REPORT_INTERVAL_SECS as f64;
