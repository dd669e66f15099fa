//! Device Service - the server-side context.
//!
//! Holds the transport, store and identity generator explicitly and wires
//! them into a [`DeviceRegistry`] and a [`MessageRouter`]. Nothing here is
//! global; a process may run several services side by side.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use extiot_core::{
    DeviceKey, Envelope, Error, IdentityGenerator, MessageType, Payload, QoS, Result, TopicKind,
    TopicScheme,
};
use extiot_storage::{DeviceRecord, DeviceStore};

use crate::registry::{DeviceRegistry, ProductCatalog, RegistryConfig};
use crate::router::{MessageRouter, RouterStats};
use crate::transport::{publish_within, Delivery, Transport};

pub struct DeviceService {
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    router: Arc<MessageRouter>,
    topics: TopicScheme,
}

impl DeviceService {
    pub fn builder() -> DeviceServiceBuilder {
        DeviceServiceBuilder::default()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Subscribe to every device's status and data topics.
    pub async fn subscribe(&self) -> Result<()> {
        let status = self.topics.wildcard(TopicKind::Status);
        let data = self.topics.wildcard(TopicKind::Data);
        self.transport.subscribe(&status, QoS::AtLeastOnce).await?;
        self.transport.subscribe(&data, QoS::AtMostOnce).await?;
        info!(status = %status, data = %data, "Device service subscribed");
        Ok(())
    }

    /// Subscribe, then route deliveries until `shutdown` fires or the
    /// transport closes the channel.
    pub async fn run(
        &self,
        inbound: mpsc::Receiver<Delivery>,
        shutdown: CancellationToken,
    ) -> Result<RouterStats> {
        self.subscribe().await?;
        Ok(self.router.clone().run(inbound, shutdown).await)
    }

    /// Merge settings into a device's config and push them to the device.
    pub async fn push_config(&self, key: &DeviceKey, settings: Payload) -> Result<DeviceRecord> {
        let record = self.registry.push_config(key, &settings).await?;
        let envelope = Envelope::new(MessageType::Config, key)
            .with_product_type(record.product_type.clone())
            .with_mac(record.mac.clone())
            .with_device_id(record.device_id)
            .with_payload(settings);
        publish_within(
            self.transport.as_ref(),
            self.registry.config().publish_timeout,
            &self.topics.config(key),
            QoS::AtLeastOnce,
            envelope.encode(),
        )
        .await?;
        info!(device = %key, device_id = %record.device_id, "Pushed config");
        Ok(record)
    }
}

/// Builder for [`DeviceService`].
#[derive(Default)]
pub struct DeviceServiceBuilder {
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn DeviceStore>>,
    generator: Option<Arc<dyn IdentityGenerator>>,
    catalog: Option<Arc<dyn ProductCatalog>>,
    topics: TopicScheme,
    config: RegistryConfig,
}

impl DeviceServiceBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn DeviceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn IdentityGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn ProductCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn topics(mut self, topics: TopicScheme) -> Self {
        self.topics = topics;
        self
    }

    pub fn registry_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<DeviceService> {
        let transport = self
            .transport
            .ok_or_else(|| Error::Config("device service needs a transport".into()))?;
        let store = self
            .store
            .ok_or_else(|| Error::Config("device service needs a store".into()))?;
        let generator = self
            .generator
            .ok_or_else(|| Error::Config("device service needs an identity generator".into()))?;

        let mut registry = DeviceRegistry::new(store, generator, self.config);
        if let Some(catalog) = self.catalog {
            registry = registry.with_catalog(catalog);
        }
        let registry = Arc::new(registry);
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            transport.clone(),
            self.topics.clone(),
        ));

        Ok(DeviceService {
            transport,
            registry,
            router,
            topics: self.topics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use extiot_core::SnowflakeGenerator;
    use extiot_storage::MemoryDeviceStore;
    use serde_json::json;

    fn service(transport: Arc<MemoryTransport>) -> DeviceService {
        DeviceService::builder()
            .transport(transport)
            .store(Arc::new(MemoryDeviceStore::new()))
            .generator(Arc::new(SnowflakeGenerator::new(3).unwrap()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_parts() {
        let err = DeviceService::builder().build().err().unwrap();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn test_subscribe_wildcards() {
        let transport = Arc::new(MemoryTransport::new());
        service(transport.clone()).subscribe().await.unwrap();

        let subs = transport.subscriptions();
        assert!(subs.contains(&("extiot/device/status/#".to_string(), QoS::AtLeastOnce)));
        assert!(subs.contains(&("extiot/device/data/#".to_string(), QoS::AtMostOnce)));
    }

    #[tokio::test]
    async fn test_push_config_publishes_to_device() {
        let transport = Arc::new(MemoryTransport::new());
        let service = service(transport.clone());
        let key = DeviceKey::new("P1", "SN001");
        let reg = service
            .registry()
            .register(&key, "thermo", "aa")
            .await
            .unwrap();

        let mut settings = Payload::new();
        settings.insert("interval".into(), json!(10));
        let record = service.push_config(&key, settings).await.unwrap();
        assert_eq!(record.current_config.get("interval"), Some(&json!(10)));

        let sent = transport.published_on("extiot/device/config/P1_SN001");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].qos, QoS::AtLeastOnce);
        let envelope = Envelope::decode(&sent[0].payload).unwrap();
        assert_eq!(envelope.message_type, MessageType::Config);
        assert_eq!(envelope.identity(), Some(reg.device_id));
        assert_eq!(envelope.payload.get("interval"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn test_push_config_unknown_device() {
        let transport = Arc::new(MemoryTransport::new());
        let err = service(transport.clone())
            .push_config(&DeviceKey::new("P1", "missing"), Payload::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(transport.published().is_empty());
    }
}
