// * Persistence: perceptual-hash index, metadata store and the storage writer
// * Goal: every accepted image is unique, written atomically and recorded exactly once

pub mod bktree;
pub mod dedup;
pub mod schema;
pub mod storage;
pub mod store;

// * Re-exports for convenient access
pub use bktree::BkTree;
pub use dedup::{DedupCheckResult, HashIndex};
pub use schema::{
    current_timestamp_ms, HashRecord, ImageRecord, NewImageRecord, SchemaError, SourceCount,
};
pub use storage::{folder_size, sanitize_segment, StorageError, StorageWriter};
pub use store::{
    AsyncResult, InMemoryMetadataStore, JsonlMetadataStore, MetadataStore, StoreError,
};
