//! Message envelope codec.
//!
//! The envelope is the unit exchanged over the pub/sub transport. On the wire it
//! is a JSON object:
//!
//! ```text
//! {
//!   "MessageType": "Register",
//!   "ProductID":   "P1",
//!   "ProductType": "thermo",
//!   "SN":          "SN001",
//!   "MAC":         "00:11:22:33:44:55",
//!   "DeviceID":    1234567890,        // absent before assignment
//!   "Payload":     { ... }            // open mapping, preserved verbatim
//! }
//! ```
//!
//! Unknown top-level fields and unknown payload fields survive a
//! decode/encode round trip, so peers on different protocol versions can
//! exchange envelopes without losing data.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

use crate::device::{DeviceIdentity, DeviceKey, Payload};
use crate::error::{Error, Result};

/// Envelope message type.
///
/// Values this build does not know decode into [`MessageType::Unknown`] and keep
/// their original name, so a newer peer never breaks an older one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Device announces itself (device → server).
    Register,
    /// Identity and current config for a registered device (server → device).
    RegisterAck,
    /// Periodic status report (device → server).
    Status,
    /// Configuration push (server → device).
    Config,
    /// Device is going away (device → server).
    Disconnect,
    /// A type introduced by a peer this build does not understand.
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Register => "Register",
            MessageType::RegisterAck => "RegisterAck",
            MessageType::Status => "Status",
            MessageType::Config => "Config",
            MessageType::Disconnect => "Disconnect",
            MessageType::Unknown(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "Register" => MessageType::Register,
            "RegisterAck" => MessageType::RegisterAck,
            "Status" => MessageType::Status,
            "Config" => MessageType::Config,
            "Disconnect" => MessageType::Disconnect,
            other => MessageType::Unknown(other.to_string()),
        }
    }

    /// Types only a device may send.
    pub fn is_device_to_server(&self) -> bool {
        matches!(
            self,
            MessageType::Register | MessageType::Status | MessageType::Disconnect
        )
    }

    /// Types only the server may send.
    pub fn is_server_to_device(&self) -> bool {
        matches!(self, MessageType::RegisterAck | MessageType::Config)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct MessageTypeVisitor;

        impl Visitor<'_> for MessageTypeVisitor {
            type Value = MessageType;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a message type name")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<MessageType, E> {
                Ok(MessageType::parse(v))
            }
        }

        deserializer.deserialize_str(MessageTypeVisitor)
    }
}

/// Typed message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "MessageType")]
    pub message_type: MessageType,

    #[serde(rename = "ProductID", default)]
    pub product_id: String,

    #[serde(rename = "ProductType", default)]
    pub product_type: String,

    #[serde(rename = "SN", default)]
    pub serial_number: String,

    #[serde(rename = "MAC", default)]
    pub mac: String,

    #[serde(rename = "DeviceID", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceIdentity>,

    #[serde(rename = "Payload", default)]
    pub payload: Payload,

    /// Top-level fields this build does not know about.
    #[serde(flatten)]
    pub extensions: Payload,
}

impl Envelope {
    /// Create an envelope addressed by a device key, with no identity and an
    /// empty payload.
    pub fn new(message_type: MessageType, key: &DeviceKey) -> Self {
        Self {
            message_type,
            product_id: key.product_id.clone(),
            product_type: String::new(),
            serial_number: key.serial_number.clone(),
            mac: String::new(),
            device_id: None,
            payload: Payload::new(),
            extensions: Payload::new(),
        }
    }

    pub fn with_product_type(mut self, product_type: impl Into<String>) -> Self {
        self.product_type = product_type.into();
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = mac.into();
        self
    }

    pub fn with_device_id(mut self, id: DeviceIdentity) -> Self {
        self.device_id = Some(id);
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// The device key this envelope is about.
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(self.product_id.clone(), self.serial_number.clone())
    }

    /// The assigned identity, treating a zero `DeviceID` as "not yet assigned".
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.device_id.filter(|id| id.value() != 0)
    }

    /// Decode an envelope from its wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedPayload(e.to_string()))
    }

    /// Encode an envelope to its wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        // String keys and JSON values only, so serialization cannot fail.
        serde_json::to_vec(self).expect("envelope serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Envelope {
        let mut payload = Payload::new();
        payload.insert("temperature".to_string(), json!(23));
        Envelope::new(MessageType::Status, &DeviceKey::new("P1", "SN001"))
            .with_product_type("thermo")
            .with_mac("00:11:22:33:44:55")
            .with_device_id(DeviceIdentity::new(7))
            .with_payload(payload)
    }

    #[test]
    fn test_wire_field_names() {
        let value: serde_json::Value = serde_json::from_slice(&sample().encode()).unwrap();
        assert_eq!(value["MessageType"], "Status");
        assert_eq!(value["ProductID"], "P1");
        assert_eq!(value["ProductType"], "thermo");
        assert_eq!(value["SN"], "SN001");
        assert_eq!(value["MAC"], "00:11:22:33:44:55");
        assert_eq!(value["DeviceID"], 7);
        assert_eq!(value["Payload"]["temperature"], 23);
    }

    #[test]
    fn test_absent_device_id_is_omitted() {
        let env = Envelope::new(MessageType::Register, &DeviceKey::new("P1", "SN001"));
        let value: serde_json::Value = serde_json::from_slice(&env.encode()).unwrap();
        assert!(value.get("DeviceID").is_none());
    }

    #[test]
    fn test_round_trip_preserves_unknown_fields() {
        let raw = br#"{
            "MessageType": "Config",
            "ProductID": "P1",
            "SN": "SN001",
            "Payload": {"interval": 10, "color": {"r": 1}},
            "Firmware": "2.1"
        }"#;
        let env = Envelope::decode(raw).unwrap();
        assert_eq!(env.message_type, MessageType::Config);
        assert_eq!(env.payload["color"], json!({"r": 1}));
        assert_eq!(env.extensions["Firmware"], "2.1");

        let again = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(again, env);
    }

    #[test]
    fn test_unknown_type_decodes() {
        let env = Envelope::decode(br#"{"MessageType": "Reboot"}"#).unwrap();
        assert_eq!(env.message_type, MessageType::Unknown("Reboot".to_string()));
        assert!(!env.message_type.is_device_to_server());
        assert!(!env.message_type.is_server_to_device());

        let value: serde_json::Value = serde_json::from_slice(&env.encode()).unwrap();
        assert_eq!(value["MessageType"], "Reboot");
    }

    #[test]
    fn test_missing_message_type_is_malformed() {
        let err = Envelope::decode(br#"{"ProductID": "P1"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(_)));
    }

    #[test]
    fn test_non_object_is_malformed() {
        for raw in [&b"not json"[..], b"[1,2,3]", b"42", b"\"Register\""] {
            let err = Envelope::decode(raw).unwrap_err();
            assert!(matches!(err, Error::MalformedPayload(_)), "{:?}", raw);
        }
    }

    #[test]
    fn test_wrong_field_types_are_malformed() {
        assert!(Envelope::decode(br#"{"MessageType": "Status", "Payload": [1]}"#).is_err());
        assert!(Envelope::decode(br#"{"MessageType": "Status", "DeviceID": "abc"}"#).is_err());
        assert!(Envelope::decode(br#"{"MessageType": 3}"#).is_err());
    }

    #[test]
    fn test_zero_device_id_is_unassigned() {
        let env = Envelope::decode(br#"{"MessageType": "Register", "DeviceID": 0}"#).unwrap();
        assert_eq!(env.device_id, Some(DeviceIdentity::new(0)));
        assert_eq!(env.identity(), None);
    }
}
