//! Status payload sources for the reporting scheduler.

use chrono::Utc;
use serde_json::{json, Value};

use extiot_core::Payload;

/// Produces the payload of each periodic status report.
pub trait StatusSource: Send + Sync {
    fn sample(&self) -> Payload;
}

/// Fixed-temperature sensor stamped with the sampling time.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    temperature: Value,
}

impl SimulatedSensor {
    pub fn new(temperature: impl Into<Value>) -> Self {
        Self {
            temperature: temperature.into(),
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(23)
    }
}

impl StatusSource for SimulatedSensor {
    fn sample(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("temperature".into(), self.temperature.clone());
        payload.insert("time".into(), json!(Utc::now().to_rfc3339()));
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_sample() {
        let payload = SimulatedSensor::default().sample();
        assert_eq!(payload.get("temperature"), Some(&json!(23)));
        let time = payload.get("time").and_then(Value::as_str).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(time).is_ok());
    }
}
