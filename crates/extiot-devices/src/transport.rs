//! Publish/subscribe transport seam.
//!
//! Inbound messages are handed to consumers through a bounded
//! `mpsc::Receiver<Delivery>` rather than callbacks, so backpressure and
//! shutdown are explicit in the consuming loop.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use extiot_core::{Error, QoS, Result};

/// One message delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Topic-addressed publish/subscribe with per-message QoS.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;
}

/// Publish with a bound on how long the transport may take to accept it.
///
/// A publish still pending after `limit` fails with [`Error::Transport`].
pub async fn publish_within(
    transport: &dyn Transport,
    limit: Duration,
    topic: &str,
    qos: QoS,
    payload: Vec<u8>,
) -> Result<()> {
    match tokio::time::timeout(limit, transport.publish(topic, qos, payload)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Transport(format!(
            "publish to {} timed out after {:?}",
            topic, limit
        ))),
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A message recorded by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

struct BrokerClient {
    id: usize,
    filters: Vec<String>,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    next_id: usize,
    clients: Vec<BrokerClient>,
}

/// In-process broker connecting [`MemoryTransport`] clients.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a client. Messages matching its subscriptions arrive on the
    /// returned receiver.
    pub fn connect(&self, capacity: usize) -> (Arc<MemoryTransport>, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.clients.push(BrokerClient {
                id,
                filters: Vec::new(),
                tx,
            });
            id
        };
        let transport = MemoryTransport {
            link: Some((self.clone(), id)),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        };
        (Arc::new(transport), rx)
    }

    fn add_filter(&self, client_id: usize, filter: &str) {
        let mut state = self.state.lock();
        if let Some(client) = state.clients.iter_mut().find(|c| c.id == client_id) {
            if !client.filters.iter().any(|f| f == filter) {
                client.filters.push(filter.to_string());
            }
        }
    }

    async fn route(&self, topic: &str, payload: &[u8]) {
        let targets: Vec<mpsc::Sender<Delivery>> = {
            let mut state = self.state.lock();
            state.clients.retain(|c| !c.tx.is_closed());
            state
                .clients
                .iter()
                .filter(|c| c.filters.iter().any(|f| topic_matches(f, topic)))
                .map(|c| c.tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(Delivery::new(topic, payload.to_vec())).await;
        }
    }
}

/// Transport that records everything it publishes and, when connected to a
/// [`MemoryBroker`], delivers it to matching subscribers.
#[derive(Default)]
pub struct MemoryTransport {
    link: Option<(MemoryBroker, usize)>,
    published: Mutex<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
}

impl MemoryTransport {
    /// A standalone transport that only records.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            qos,
            payload: payload.clone(),
        });
        if let Some((broker, _)) = &self.link {
            broker.route(topic, &payload).await;
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.subscriptions.lock().push((filter.to_string(), qos));
        if let Some((broker, id)) = &self.link {
            broker.add_filter(*id, filter);
        }
        Ok(())
    }
}
