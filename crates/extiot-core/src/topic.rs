//! Topic addressing scheme.
//!
//! | Purpose                 | Topic                         | Direction       |
//! |-------------------------|-------------------------------|-----------------|
//! | Status / telemetry      | `{prefix}/data/{pid}_{sn}`    | device → server |
//! | Registration / status   | `{prefix}/status/{pid}_{sn}`  | device → server |
//! | Config push / reg. ack  | `{prefix}/config/{pid}_{sn}`  | server → device |
//!
//! The default prefix is `extiot/device`.

use serde::{Deserialize, Serialize};

use crate::config::topics;
use crate::device::DeviceKey;

/// Which per-device channel a topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Data,
    Status,
    Config,
}

impl TopicKind {
    fn segment(self) -> &'static str {
        match self {
            TopicKind::Data => topics::DATA,
            TopicKind::Status => topics::STATUS,
            TopicKind::Config => topics::CONFIG,
        }
    }
}

/// A topic split back into its channel and device token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub kind: TopicKind,
    pub token: String,
}

/// Builds and parses per-device topics under a common prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new(topics::DEFAULT_PREFIX)
    }
}

impl TopicScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn data(&self, key: &DeviceKey) -> String {
        self.for_token(TopicKind::Data, &key.token())
    }

    pub fn status(&self, key: &DeviceKey) -> String {
        self.for_token(TopicKind::Status, &key.token())
    }

    pub fn config(&self, key: &DeviceKey) -> String {
        self.for_token(TopicKind::Config, &key.token())
    }

    /// Topic for a raw device token such as `P1_SN001`.
    pub fn for_token(&self, kind: TopicKind, token: &str) -> String {
        format!("{}/{}/{}", self.prefix, kind.segment(), token)
    }

    /// Multi-level wildcard filter the server subscribes to for a channel.
    pub fn wildcard(&self, kind: TopicKind) -> String {
        format!("{}/{}/#", self.prefix, kind.segment())
    }

    /// Split a concrete topic into its channel and device token.
    pub fn parse(&self, topic: &str) -> Option<ParsedTopic> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let (segment, token) = rest.split_once('/')?;
        if token.is_empty() || token.contains('/') {
            return None;
        }
        let kind = match segment {
            s if s == topics::DATA => TopicKind::Data,
            s if s == topics::STATUS => TopicKind::Status,
            s if s == topics::CONFIG => TopicKind::Config,
            _ => return None,
        };
        Some(ParsedTopic {
            kind,
            token: token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_topics() {
        let scheme = TopicScheme::default();
        let key = DeviceKey::new("P1", "SN001");
        assert_eq!(scheme.data(&key), "extiot/device/data/P1_SN001");
        assert_eq!(scheme.status(&key), "extiot/device/status/P1_SN001");
        assert_eq!(scheme.config(&key), "extiot/device/config/P1_SN001");
        assert_eq!(scheme.wildcard(TopicKind::Status), "extiot/device/status/#");
    }

    #[test]
    fn test_trailing_slash_prefix() {
        let scheme = TopicScheme::new("acme/iot/");
        assert_eq!(scheme.wildcard(TopicKind::Data), "acme/iot/data/#");
    }

    #[test]
    fn test_parse_topic() {
        let scheme = TopicScheme::default();
        let parsed = scheme.parse("extiot/device/config/P1_SN001").unwrap();
        assert_eq!(parsed.kind, TopicKind::Config);
        assert_eq!(parsed.token, "P1_SN001");

        assert!(scheme.parse("extiot/device/other/P1_SN001").is_none());
        assert!(scheme.parse("extiot/device/data/").is_none());
        assert!(scheme.parse("extiot/device/data/a/b").is_none());
        assert!(scheme.parse("other/device/data/P1_SN001").is_none());
    }
}
