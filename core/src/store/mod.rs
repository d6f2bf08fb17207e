// Store module — durable persistence behind the coordinator

pub mod backend;
pub mod records;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StoreError};
pub use records::{Record, RecordStore};
