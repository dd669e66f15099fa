//! In-memory device store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use extiot_core::{DeviceKey, Payload};

use crate::store::{DeviceRecord, DeviceStore, InsertOutcome};
use crate::Result;

/// Device store kept in process memory. Records are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<HashMap<DeviceKey, DeviceRecord>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn find_by_key(&self, key: &DeviceKey) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.read().get(key).cloned())
    }

    async fn insert_if_absent(&self, record: DeviceRecord) -> Result<InsertOutcome> {
        match self.devices.write().entry(record.key.clone()) {
            Entry::Occupied(existing) => Ok(InsertOutcome::AlreadyExists(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn touch_last_seen(&self, key: &DeviceKey, at: DateTime<Utc>) -> Result<bool> {
        match self.devices.write().get_mut(key) {
            Some(record) => {
                record.last_seen_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_config(
        &self,
        key: &DeviceKey,
        settings: &Payload,
    ) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.write().get_mut(key).map(|record| {
            record.merge_config(settings);
            record.clone()
        }))
    }

    async fn device_count(&self) -> Result<usize> {
        Ok(self.devices.read().len())
    }
}
