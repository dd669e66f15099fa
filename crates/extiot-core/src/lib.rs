//! Core protocol types for ExtIoT.
//!
//! This crate holds the pieces both sides of the device protocol share: the
//! message envelope codec, the topic scheme, the identity generator, and the
//! unified error taxonomy.

pub mod config;
pub mod device;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod topic;

pub use config::{DeviceProfile, MqttConfig, QoS};
pub use device::{DeviceIdentity, DeviceKey, Payload};
pub use envelope::{Envelope, MessageType};
pub use error::{Error, Result};
pub use identity::{
    Clock, IdentityGenerator, IdentityParts, RegressionPolicy, SnowflakeGenerator, SystemClock,
};
pub use topic::{ParsedTopic, TopicKind, TopicScheme};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{defaults, env_vars, topics, DeviceProfile, MqttConfig, QoS};
    pub use crate::device::{DeviceIdentity, DeviceKey, Payload};
    pub use crate::envelope::{Envelope, MessageType};
    pub use crate::error::{Error, Result};
    pub use crate::identity::{IdentityGenerator, SnowflakeGenerator};
    pub use crate::topic::{TopicKind, TopicScheme};
}
