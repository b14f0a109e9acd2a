//! Storage abstractions for pipeline persistence.
//!
//! Everything the engine persists goes through a [`BlobStore`]: byte-level
//! get/put keyed by slash-separated paths. On top of it sit the
//! [`ItemStore`] (one document per work item) and the [`Registry`]
//! (one JSON file per stage).
//!
//! ## Directory Structure
//!
//! ```text
//! {root}/
//! ├── config.toml
//! ├── inbox/YYYY-MM-DD.json             # Raw posts for the inbox source
//! ├── stages/{stage}/YYYY-MM-DD/{key}.md
//! ├── registry/{stage}.json
//! ├── locks/{stage}.lock
//! ├── quarantine/{stage}/YYYY-MM-DD/{key}.md
//! └── exports/{stage}/{run_date}_last_{N}_days.parquet
//! ```

pub mod items;
pub mod local;
pub mod lock;
pub mod registry;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;

use crate::error::Result;

// Re-export for convenience
pub use items::ItemStore;
pub use local::LocalBlobStore;
pub use lock::StageLock;
pub use registry::{Outcome, ProcessingState, Registry, RegistryCounts, RegistryEntry};

/// Durable byte storage.
///
/// Implementations must make `put` atomic from a reader's point of view and
/// must report an unreachable medium as `AppError::StorageUnavailable`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read an object, returning `None` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace an object.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Create an object only if it does not exist yet. Returns `false` if it did.
    async fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool>;

    /// Delete an object. Returns `false` if there was nothing to delete.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All committed keys under `prefix`, recursively, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Human-readable location for log output.
    fn location(&self, key: &str) -> String;
}
