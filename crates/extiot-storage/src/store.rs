//! Device store contract.
//!
//! The registry never relies on an in-process lock for the one-record-per-key
//! invariant; the store enforces it in `insert_if_absent` and reports the
//! existing record when a concurrent insert won.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use extiot_core::{DeviceIdentity, DeviceKey, Payload};

use crate::Result;

/// Persistent state for one registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub key: DeviceKey,
    pub device_id: DeviceIdentity,
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub mac: String,
    /// Settings pushed to the device, merged by config pushes.
    #[serde(default)]
    pub current_config: Payload,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn new(
        key: DeviceKey,
        device_id: DeviceIdentity,
        product_type: impl Into<String>,
        mac: impl Into<String>,
        current_config: Payload,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            device_id,
            product_type: product_type.into(),
            mac: mac.into(),
            current_config,
            created_at: now,
            last_seen_at: now,
        }
    }

    /// Merge settings into the current config, overwriting keys present in both.
    pub fn merge_config(&mut self, settings: &Payload) {
        for (name, value) in settings {
            self.current_config.insert(name.clone(), value.clone());
        }
    }
}

/// Result of [`DeviceStore::insert_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same key already existed; it is returned unchanged.
    AlreadyExists(DeviceRecord),
}

/// Keyed persistence for device records.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Look up a record by its natural key.
    async fn find_by_key(&self, key: &DeviceKey) -> Result<Option<DeviceRecord>>;

    /// Insert a record unless one with the same key exists.
    async fn insert_if_absent(&self, record: DeviceRecord) -> Result<InsertOutcome>;

    /// Update `last_seen_at`. Returns `false` if the key is unknown.
    async fn touch_last_seen(&self, key: &DeviceKey, at: DateTime<Utc>) -> Result<bool>;

    /// Merge settings into the stored config. Returns `None` if the key is unknown.
    async fn update_config(
        &self,
        key: &DeviceKey,
        settings: &Payload,
    ) -> Result<Option<DeviceRecord>>;

    /// Number of stored records.
    async fn device_count(&self) -> Result<usize>;
}
