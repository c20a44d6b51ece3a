//! Storage abstraction layer
//!
//! All index artifacts, the manifest, the dataset registry and record-file
//! bytes are read and written through this interface. Published artifacts
//! are immutable; `rename` exists so the manifest can be replaced atomically.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

pub mod layout;
pub mod local;
pub mod writer;

/// Storage backend trait
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read object from storage
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Write object to storage
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete object from storage
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if object exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List object keys under a prefix, recursively, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get object with byte range `[start, end)`
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes>;

    /// Atomically replace `to` with `from`. `from` must exist.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Storage configuration
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local { root_path: String },
}

/// Create storage backend from config
pub fn create_storage(config: StorageConfig) -> Result<Box<dyn StorageBackend>> {
    match config {
        StorageConfig::Local { root_path } => {
            let backend = local::LocalStorage::new(root_path)?;
            Ok(Box::new(backend))
        }
    }
}
