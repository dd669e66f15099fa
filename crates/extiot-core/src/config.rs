//! Shared configuration defaults and helpers.
//!
//! Keeps topic segments, protocol defaults and environment variable names in one
//! place so the server, the device agent and the CLI agree on them.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::device::DeviceKey;
use crate::error::{Error, Result};

/// Topic segments.
pub mod topics {
    pub const DEFAULT_PREFIX: &str = "extiot/device";
    pub const DATA: &str = "data";
    pub const STATUS: &str = "status";
    pub const CONFIG: &str = "config";
}

/// Protocol defaults.
pub mod defaults {
    pub const BROKER_HOST: &str = "127.0.0.1";
    pub const BROKER_PORT: u16 = 1883;
    pub const SERVER_CLIENT_ID: &str = "deviceservice";
    pub const KEEP_ALIVE_SECS: u64 = 60;
    /// Capacity of the delivery queue between transport and router.
    pub const INBOUND_CAPACITY: usize = 256;
    /// Identity generator node id when none is configured.
    pub const NODE_ID: u16 = 1;
    /// Reporting interval a device starts with before any config arrives.
    pub const REPORT_INTERVAL_SECS: u64 = 5;
    /// Upper bound on waiting for one publish to complete.
    pub const PUBLISH_TIMEOUT_SECS: u64 = 3;
    /// Upper bound on one device store round-trip.
    pub const STORE_TIMEOUT_SECS: u64 = 5;
    /// Longest reporting interval a config may request (one week).
    pub const MAX_REPORT_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;
    /// Ticks without an ack before a device re-announces itself.
    pub const REANNOUNCE_EVERY_TICKS: u32 = 12;
    /// Payload field carrying the reporting interval in seconds.
    pub const INTERVAL_FIELD: &str = "interval";
    /// Payload field asking a device to register again.
    pub const REREGISTER_FIELD: &str = "reregister";
}

/// Environment variable names.
pub mod env_vars {
    pub const BROKER: &str = "EXTIOT_BROKER";
    pub const PORT: &str = "EXTIOT_PORT";
    pub const USER: &str = "EXTIOT_USER";
    pub const PASSWORD: &str = "EXTIOT_PASSWORD";
    pub const NODE_ID: &str = "EXTIOT_NODE_ID";
    pub const DB_PATH: &str = "EXTIOT_DB";
    pub const TOPIC_PREFIX: &str = "EXTIOT_TOPIC_PREFIX";
    pub const LOG_JSON: &str = "EXTIOT_LOG_JSON";
}

/// Transport QoS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_level(level: u8) -> Result<Self> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(Error::Config(format!("invalid QoS level {}", other))),
        }
    }

    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    pub broker: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client ID
    pub client_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    #[serde(default)]
    pub clean_session: bool,

    /// Capacity of the inbound delivery queue
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

fn default_port() -> u16 {
    defaults::BROKER_PORT
}
fn default_keep_alive() -> u64 {
    defaults::KEEP_ALIVE_SECS
}
fn default_inbound_capacity() -> usize {
    defaults::INBOUND_CAPACITY
}

impl MqttConfig {
    pub fn new(broker: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: defaults::BROKER_PORT,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: defaults::KEEP_ALIVE_SECS,
            clean_session: false,
            inbound_capacity: defaults::INBOUND_CAPACITY,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    pub fn full_broker_addr(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }

    /// Accepts `host`, `host:port`, `tcp://host:port` or `mqtt://host:port`.
    pub fn parse_broker(url: &str) -> Result<(String, u16)> {
        let rest = url
            .strip_prefix("tcp://")
            .or_else(|| url.strip_prefix("mqtt://"))
            .unwrap_or(url);
        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid broker port in '{}'", url)))?;
                if host.is_empty() {
                    return Err(Error::Config(format!("missing broker host in '{}'", url)));
                }
                Ok((host.to_string(), port))
            }
            None if !rest.is_empty() => Ok((rest.to_string(), defaults::BROKER_PORT)),
            None => Err(Error::Config("empty broker address".to_string())),
        }
    }
}

/// Manufacture-time description of a device, read from its JSON config file.
///
/// ```json
/// {"ProductType": "thermo", "ProductId": "P1", "SN": "SN001", "MAC": "00:11:22:33:44:55"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    #[serde(rename = "ProductType")]
    pub product_type: String,
    #[serde(rename = "ProductId", alias = "ProductID")]
    pub product_id: String,
    #[serde(rename = "SN")]
    pub serial_number: String,
    #[serde(rename = "MAC")]
    pub mac: String,
}

impl DeviceProfile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid device config {}: {}", path.display(), e)))
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.product_id.clone(), self.serial_number.clone())
    }
}

/// Read a boolean flag from the environment, accepting `true`/`1`.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker() {
        assert_eq!(
            MqttConfig::parse_broker("tcp://10.10.1.1:1883").unwrap(),
            ("10.10.1.1".to_string(), 1883)
        );
        assert_eq!(
            MqttConfig::parse_broker("broker.local").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            MqttConfig::parse_broker("mqtt://h:8883").unwrap(),
            ("h".to_string(), 8883)
        );
        assert!(MqttConfig::parse_broker("tcp://h:notaport").is_err());
        assert!(MqttConfig::parse_broker("").is_err());
        assert!(MqttConfig::parse_broker(":1883").is_err());
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(QoS::from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(QoS::ExactlyOnce.level(), 2);
        assert!(QoS::from_level(3).is_err());
    }

    #[test]
    fn test_device_profile_parse() {
        let profile: DeviceProfile = serde_json::from_str(
            r#"{"ProductType":"thermo","ProductId":"P1","SN":"SN001","MAC":"aa:bb"}"#,
        )
        .unwrap();
        assert_eq!(profile.key(), DeviceKey::new("P1", "SN001"));
        assert_eq!(profile.mac, "aa:bb");
    }

    #[test]
    fn test_mqtt_config_defaults_from_json() {
        let config: MqttConfig =
            serde_json::from_str(r#"{"broker":"localhost","client_id":"c1"}"#).unwrap();
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive, 60);
        assert_eq!(config.inbound_capacity, defaults::INBOUND_CAPACITY);
        assert_eq!(config.full_broker_addr(), "localhost:1883");
    }
}
