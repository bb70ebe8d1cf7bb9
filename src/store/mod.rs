//! Persistent key-value store for application data.
//!
//! - values keep their semantic type (string, number, boolean, object,
//!   array, date) across a round trip
//! - everything but numbers is encrypted unless disabled
//! - entries may carry a TTL and are never returned once expired
//! - reads are served from an in-memory cache kept in step with the backend

mod entry;
mod local;
mod storage;
mod traits;
mod value;

pub use entry::{EntryMetadata, Priority, StorageEntry};
pub use local::{
  ExportDocument, LocalStore, SetOptions, StorageStats, StoreEvent, StoreOptions,
  APP_SETTINGS_KEY, CACHE_PREFIX, EXPORT_VERSION, USER_DATA_KEY,
};
pub use storage::{MemoryBackend, SqliteBackend};
pub use traits::KvBackend;
pub use value::{DataType, StoreValue};
