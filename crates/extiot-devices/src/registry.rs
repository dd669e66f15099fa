//! Device registry.
//!
//! Assigns permanent identities to devices on first registration and keeps
//! their last-seen time current. Uniqueness per device key is enforced by the
//! store's `insert_if_absent`, never by a lock held here.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use extiot_core::config::defaults;
use extiot_core::{DeviceIdentity, DeviceKey, Error, IdentityGenerator, Payload, Result};
use extiot_storage::{DeviceRecord, DeviceStore, InsertOutcome};

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound on a single store round-trip.
    pub store_timeout: Duration,
    /// Upper bound on each server publish (acks, prompts, pushed config).
    pub publish_timeout: Duration,
    /// Config assigned to newly registered devices.
    pub default_config: Payload,
    /// Ask devices reporting under an unknown key to register again.
    pub prompt_reregister: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(defaults::STORE_TIMEOUT_SECS),
            publish_timeout: Duration::from_secs(defaults::PUBLISH_TIMEOUT_SECS),
            default_config: Payload::new(),
            prompt_reregister: true,
        }
    }
}

/// Known (product id, product type) pairs.
pub trait ProductCatalog: Send + Sync {
    fn is_known(&self, product_id: &str, product_type: &str) -> bool;
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub device_id: DeviceIdentity,
    pub config: Payload,
    /// `false` when the device was already registered.
    pub created: bool,
}

impl Registration {
    fn existing(record: DeviceRecord) -> Self {
        Self {
            device_id: record.device_id,
            config: record.current_config,
            created: false,
        }
    }
}

/// Idempotent registration over a [`DeviceStore`].
pub struct DeviceRegistry {
    store: Arc<dyn DeviceStore>,
    generator: Arc<dyn IdentityGenerator>,
    catalog: Option<Arc<dyn ProductCatalog>>,
    config: RegistryConfig,
}

impl DeviceRegistry {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        generator: Arc<dyn IdentityGenerator>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            generator,
            catalog: None,
            config,
        }
    }

    /// Reject registrations for products the catalog does not know.
    pub fn with_catalog(mut self, catalog: Arc<dyn ProductCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a device, or return its existing identity and config.
    ///
    /// The generator is consulted only when no record exists yet. When a
    /// concurrent registration wins the insert, the winner's record is
    /// returned and the identity generated here is discarded.
    pub async fn register(
        &self,
        key: &DeviceKey,
        product_type: &str,
        mac: &str,
    ) -> Result<Registration> {
        if let Some(catalog) = &self.catalog {
            if !catalog.is_known(&key.product_id, product_type) {
                return Err(Error::UnknownProduct {
                    product_id: key.product_id.clone(),
                    product_type: product_type.to_string(),
                });
            }
        }

        if let Some(existing) = self
            .store_call("find_by_key", self.store.find_by_key(key))
            .await?
        {
            debug!(device = %key, device_id = %existing.device_id, "Device already registered");
            return Ok(Registration::existing(existing));
        }

        let device_id = self.generate_identity().await?;
        let record = DeviceRecord::new(
            key.clone(),
            device_id,
            product_type,
            mac,
            self.config.default_config.clone(),
        );
        let config = record.current_config.clone();

        match self
            .store_call("insert_if_absent", self.store.insert_if_absent(record))
            .await?
        {
            InsertOutcome::Inserted => {
                info!(device = %key, device_id = %device_id, product_type, "Registered device");
                Ok(Registration {
                    device_id,
                    config,
                    created: true,
                })
            }
            InsertOutcome::AlreadyExists(existing) => {
                debug!(
                    device = %key,
                    discarded = %device_id,
                    device_id = %existing.device_id,
                    "Concurrent registration won, returning its identity"
                );
                Ok(Registration::existing(existing))
            }
        }
    }

    /// Record that a registered device reported in.
    pub async fn record_status(&self, key: &DeviceKey, payload: &Payload) -> Result<()> {
        let found = self
            .store_call("touch_last_seen", self.store.touch_last_seen(key, Utc::now()))
            .await?;
        if !found {
            return Err(Error::NotFound(key.to_string()));
        }
        debug!(device = %key, fields = payload.len(), "Status recorded");
        Ok(())
    }

    /// Merge settings into a device's stored config.
    pub async fn push_config(&self, key: &DeviceKey, settings: &Payload) -> Result<DeviceRecord> {
        self.store_call("update_config", self.store.update_config(key, settings))
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    pub async fn lookup(&self, key: &DeviceKey) -> Result<Option<DeviceRecord>> {
        self.store_call("find_by_key", self.store.find_by_key(key))
            .await
    }

    pub async fn device_count(&self) -> Result<usize> {
        self.store_call("device_count", self.store.device_count())
            .await
    }

    async fn generate_identity(&self) -> Result<DeviceIdentity> {
        if !self.generator.may_block() {
            return self.generator.generate();
        }
        let generator = self.generator.clone();
        tokio::task::spawn_blocking(move || generator.generate())
            .await
            .map_err(|e| Error::Config(format!("identity generator task failed: {}", e)))?
    }

    async fn store_call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = extiot_storage::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => {
                warn!(op, timeout = ?self.config.store_timeout, "Store round-trip timed out");
                Err(Error::StoreUnavailable(format!(
                    "{} timed out after {:?}",
                    op, self.config.store_timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extiot_core::SnowflakeGenerator;
    use extiot_storage::MemoryDeviceStore;
    use serde_json::json;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(
            Arc::new(MemoryDeviceStore::new()),
            Arc::new(SnowflakeGenerator::new(1).unwrap()),
            RegistryConfig::default(),
        )
    }

    struct OnlyThermo;

    impl ProductCatalog for OnlyThermo {
        fn is_known(&self, _product_id: &str, product_type: &str) -> bool {
            product_type == "thermo"
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = registry();
        let key = DeviceKey::new("P1", "SN001");

        let first = registry.register(&key, "thermo", "aa").await.unwrap();
        assert!(first.created);
        assert!(first.config.is_empty());

        let second = registry.register(&key, "thermo", "aa").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.device_id, first.device_id);
        assert_eq!(registry.device_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_register_uses_default_config() {
        let mut config = RegistryConfig::default();
        config.default_config.insert("interval".into(), json!(5));
        let registry = DeviceRegistry::new(
            Arc::new(MemoryDeviceStore::new()),
            Arc::new(SnowflakeGenerator::new(1).unwrap()),
            config,
        );

        let reg = registry
            .register(&DeviceKey::new("P1", "SN001"), "thermo", "aa")
            .await
            .unwrap();
        assert_eq!(reg.config.get("interval"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn test_record_status_unknown_device() {
        let registry = registry();
        let err = registry
            .record_status(&DeviceKey::new("P1", "missing"), &Payload::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_record_status_updates_last_seen() {
        let registry = registry();
        let key = DeviceKey::new("P1", "SN001");
        registry.register(&key, "thermo", "aa").await.unwrap();
        let before = registry.lookup(&key).await.unwrap().unwrap().last_seen_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.record_status(&key, &Payload::new()).await.unwrap();

        let after = registry.lookup(&key).await.unwrap().unwrap();
        assert!(after.last_seen_at > before);
        assert_eq!(after.created_at, before);
    }

    #[tokio::test]
    async fn test_push_config_merges() {
        let registry = registry();
        let key = DeviceKey::new("P1", "SN001");
        registry.register(&key, "thermo", "aa").await.unwrap();

        let mut settings = Payload::new();
        settings.insert("interval".into(), json!(10));
        let record = registry.push_config(&key, &settings).await.unwrap();
        assert_eq!(record.current_config.get("interval"), Some(&json!(10)));

        let err = registry
            .push_config(&DeviceKey::new("P1", "missing"), &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    /// Generator that sleeps and records the thread it ran on.
    struct SleepyGenerator {
        inner: SnowflakeGenerator,
        ran_on: parking_lot::Mutex<Option<std::thread::ThreadId>>,
    }

    impl IdentityGenerator for SleepyGenerator {
        fn generate(&self) -> Result<DeviceIdentity> {
            *self.ran_on.lock() = Some(std::thread::current().id());
            std::thread::sleep(Duration::from_millis(2));
            self.inner.generate()
        }

        fn may_block(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_blocking_generator_runs_off_the_runtime_thread() {
        let generator = Arc::new(SleepyGenerator {
            inner: SnowflakeGenerator::new(1).unwrap(),
            ran_on: parking_lot::Mutex::new(None),
        });
        let registry = DeviceRegistry::new(
            Arc::new(MemoryDeviceStore::new()),
            generator.clone(),
            RegistryConfig::default(),
        );

        let reg = registry
            .register(&DeviceKey::new("P1", "SN001"), "thermo", "aa")
            .await
            .unwrap();
        assert!(reg.created);
        let ran_on = generator.ran_on.lock().unwrap();
        assert_ne!(ran_on, std::thread::current().id());
    }

    #[tokio::test]
    async fn test_catalog_rejects_unknown_product() {
        let registry = registry().with_catalog(Arc::new(OnlyThermo));

        let err = registry
            .register(&DeviceKey::new("P1", "SN001"), "kettle", "aa")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_product");
        assert_eq!(registry.device_count().await.unwrap(), 0);

        assert!(registry
            .register(&DeviceKey::new("P1", "SN001"), "thermo", "aa")
            .await
            .is_ok());
    }
}
