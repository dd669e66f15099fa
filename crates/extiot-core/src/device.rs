//! Device identity types shared by the server and device sides.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Open mapping of setting/metric name to value carried in envelopes and
/// stored as a device's current configuration.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Natural key assigned at manufacture: `(ProductID, SerialNumber)`.
///
/// Used for registry lookup and topic addressing, never as wire identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub product_id: String,
    pub serial_number: String,
}

impl DeviceKey {
    pub fn new(product_id: impl Into<String>, serial_number: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            serial_number: serial_number.into(),
        }
    }

    /// Topic token `{pid}_{sn}` used in every per-device topic.
    pub fn token(&self) -> String {
        format!("{}_{}", self.product_id, self.serial_number)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.product_id, self.serial_number)
    }
}

/// Server-assigned device identity. Permanent once issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(i64);

impl DeviceIdentity {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<DeviceIdentity> for i64 {
    fn from(id: DeviceIdentity) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_token() {
        let key = DeviceKey::new("P1", "SN001");
        assert_eq!(key.token(), "P1_SN001");
        assert_eq!(key.to_string(), "P1_SN001");
    }

    #[test]
    fn test_identity_serializes_as_integer() {
        let id = DeviceIdentity::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
    }
}
