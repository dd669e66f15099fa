//! Device store implementations for ExtIoT.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `redb` | ✅ | Persistent store on an embedded redb file |

pub mod error;
pub mod memory;
#[cfg(feature = "redb")]
pub mod redb_store;
pub mod store;

pub use error::{Error, Result};
pub use memory::MemoryDeviceStore;
#[cfg(feature = "redb")]
pub use redb_store::RedbDeviceStore;
pub use store::{DeviceRecord, DeviceStore, InsertOutcome};
