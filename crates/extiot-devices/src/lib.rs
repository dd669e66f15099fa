//! Device protocol services for ExtIoT.
//!
//! Both ends of the device protocol live here: the server-side registry and
//! router, wired together by [`DeviceService`], and the device-side
//! [`DeviceAgent`] with its adaptive reporting scheduler.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | MQTT transport over rumqttc |
//!
//! ## Architecture
//!
//! - **Transport**: topic-addressed publish/subscribe; deliveries arrive on a bounded channel
//! - **DeviceRegistry**: idempotent registration over a `DeviceStore`
//! - **MessageRouter**: dispatches server-bound envelopes by message type
//! - **DeviceService**: explicit context owning transport, store and generator
//! - **ReportScheduler**: one cancellable periodic reporting task per device
//! - **DeviceAgent**: the device process, applying config pushed by the server

pub mod agent;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod sensor;
pub mod service;
pub mod transport;

pub use agent::{AgentEvent, ConfigOutcome, DeviceAgent};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
pub use registry::{DeviceRegistry, ProductCatalog, Registration, RegistryConfig};
pub use router::{MessageRouter, Presence, RouteOutcome, RouterStats};
pub use scheduler::{
    requested_interval, ReportScheduler, Reporter, ScheduleState, SchedulerConfig,
};
pub use sensor::{SimulatedSensor, StatusSource};
pub use service::{DeviceService, DeviceServiceBuilder};
pub use transport::{
    publish_within, topic_matches, Delivery, MemoryBroker, MemoryTransport, PublishedMessage,
    Transport,
};
