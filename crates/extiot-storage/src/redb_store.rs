//! Device store using redb.
//!
//! Records are stored as JSON under the composite key `(product_id, serial)`.
//! redb serializes write transactions, so the check-then-insert inside one write
//! transaction is the uniqueness constraint on the device key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use extiot_core::{DeviceKey, Payload};

use crate::store::{DeviceRecord, DeviceStore, InsertOutcome};
use crate::{Error, Result};

// Devices table: key = (product_id, serial_number), value = DeviceRecord (JSON)
const DEVICES_TABLE: TableDefinition<(&str, &str), &str> = TableDefinition::new("devices");

/// Device store backed by a redb file.
pub struct RedbDeviceStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbDeviceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbDeviceStore")
            .field("path", &self.path)
            .finish()
    }
}

impl RedbDeviceStore {
    /// Open or create a device store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = if path_ref.exists() {
            Database::open(path_ref)?
        } else {
            Database::create(path_ref)?
        };

        // Make sure the table exists so read transactions can open it.
        let write_txn = db.begin_write()?;
        {
            let _devices = write_txn.open_table(DEVICES_TABLE)?;
        }
        write_txn.commit()?;

        tracing::debug!(path = %path_ref.display(), "Opened device store");
        Ok(Self {
            db: Arc::new(db),
            path: path_ref.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a blocking database closure off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

fn load(db: &Database, key: &DeviceKey) -> Result<Option<DeviceRecord>> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(DEVICES_TABLE)?;
    let value = table.get((key.product_id.as_str(), key.serial_number.as_str()))?;
    match value {
        Some(json) => Ok(Some(serde_json::from_str(json.value())?)),
        None => Ok(None),
    }
}

/// Read-modify-write of one record inside a single write transaction.
fn modify<F>(db: &Database, key: &DeviceKey, f: F) -> Result<Option<DeviceRecord>>
where
    F: FnOnce(&mut DeviceRecord),
{
    let k = (key.product_id.as_str(), key.serial_number.as_str());
    let write_txn = db.begin_write()?;
    let updated = {
        let mut table = write_txn.open_table(DEVICES_TABLE)?;
        let current = table.get(k)?.map(|v| v.value().to_string());
        match current {
            Some(json) => {
                let mut record: DeviceRecord = serde_json::from_str(&json)?;
                f(&mut record);
                let json = serde_json::to_string(&record)?;
                table.insert(k, json.as_str())?;
                Some(record)
            }
            None => None,
        }
    };
    write_txn.commit()?;
    Ok(updated)
}

#[async_trait]
impl DeviceStore for RedbDeviceStore {
    async fn find_by_key(&self, key: &DeviceKey) -> Result<Option<DeviceRecord>> {
        let key = key.clone();
        self.blocking(move |db| load(db, &key)).await
    }

    async fn insert_if_absent(&self, record: DeviceRecord) -> Result<InsertOutcome> {
        self.blocking(move |db| {
            let json = serde_json::to_string(&record)?;
            let k = (
                record.key.product_id.as_str(),
                record.key.serial_number.as_str(),
            );
            let write_txn = db.begin_write()?;
            let existing = {
                let mut table = write_txn.open_table(DEVICES_TABLE)?;
                let existing = table.get(k)?.map(|v| v.value().to_string());
                if existing.is_none() {
                    table.insert(k, json.as_str())?;
                }
                existing
            };
            match existing {
                Some(existing) => {
                    write_txn.abort()?;
                    Ok(InsertOutcome::AlreadyExists(serde_json::from_str(&existing)?))
                }
                None => {
                    write_txn.commit()?;
                    Ok(InsertOutcome::Inserted)
                }
            }
        })
        .await
    }

    async fn touch_last_seen(&self, key: &DeviceKey, at: DateTime<Utc>) -> Result<bool> {
        let key = key.clone();
        self.blocking(move |db| {
            Ok(modify(db, &key, |record| record.last_seen_at = at)?.is_some())
        })
        .await
    }

    async fn update_config(
        &self,
        key: &DeviceKey,
        settings: &Payload,
    ) -> Result<Option<DeviceRecord>> {
        let key = key.clone();
        let settings = settings.clone();
        self.blocking(move |db| modify(db, &key, |record| record.merge_config(&settings)))
            .await
    }

    async fn device_count(&self) -> Result<usize> {
        self.blocking(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(DEVICES_TABLE)?;
            Ok(table.len()? as usize)
        })
        .await
    }
}
