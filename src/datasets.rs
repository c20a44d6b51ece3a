//! Durable dataset registry
//!
//! Datasets are registered once by name and receive a stable small-integer
//! id. Ids are assigned monotonically and never reused or reassigned, so the
//! mapping file only ever grows.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::storage::StorageBackend;
use crate::types::DatasetId;
use crate::{Error, Result};

const REGISTRY_KEY: &str = "registry/datasets.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    next_dataset_id: DatasetId,
    datasets: BTreeMap<String, DatasetId>,
}

/// Persistent dataset name → id mapping.
pub struct DatasetRegistry {
    storage: Arc<dyn StorageBackend>,
    datasets: BTreeMap<String, DatasetId>,
    next_dataset_id: DatasetId,
}

impl std::fmt::Debug for DatasetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetRegistry")
            .field("datasets", &self.datasets)
            .field("next_dataset_id", &self.next_dataset_id)
            .finish_non_exhaustive()
    }
}

impl DatasetRegistry {
    /// Load the registry, or start empty if none exists yet.
    pub async fn load(storage: Arc<dyn StorageBackend>) -> Result<Self> {
        let mut registry = Self {
            storage,
            datasets: BTreeMap::new(),
            next_dataset_id: 0,
        };

        if registry.storage.exists(REGISTRY_KEY).await? {
            let data = registry.storage.get(REGISTRY_KEY).await?;
            let file: RegistryFile = serde_json::from_slice(&data).map_err(|e| {
                Error::format_invalid(format!("dataset registry unreadable: {}", e))
            })?;

            let max_assigned = file.datasets.values().copied().max();
            registry.next_dataset_id = file
                .next_dataset_id
                .max(max_assigned.map_or(0, |m| m + 1));
            registry.datasets = file.datasets;
        }

        Ok(registry)
    }

    /// Register a dataset name, returning its stable id. Re-registering an
    /// existing name returns the original id without touching storage.
    pub async fn register(&mut self, name: &str) -> Result<DatasetId> {
        if name.is_empty() {
            return Err(Error::config_invalid("dataset name must be non-empty"));
        }

        if let Some(&id) = self.datasets.get(name) {
            return Ok(id);
        }

        let id = self.next_dataset_id;
        self.next_dataset_id = self
            .next_dataset_id
            .checked_add(1)
            .ok_or_else(|| Error::internal("dataset id space exhausted"))?;
        self.datasets.insert(name.to_string(), id);
        self.save().await?;

        tracing::info!("Registered dataset '{}' with id {}", name, id);
        Ok(id)
    }

    pub fn id_of(&self, name: &str) -> Option<DatasetId> {
        self.datasets.get(name).copied()
    }

    pub fn datasets(&self) -> &BTreeMap<String, DatasetId> {
        &self.datasets
    }

    async fn save(&self) -> Result<()> {
        let file = RegistryFile {
            next_dataset_id: self.next_dataset_id,
            datasets: self.datasets.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let temp_key = format!("{}.tmp", REGISTRY_KEY);
        self.storage.put(&temp_key, Bytes::from(json)).await?;
        self.storage.rename(&temp_key, REGISTRY_KEY).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ids_are_stable_across_loads() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());

        let mut registry = DatasetRegistry::load(storage.clone()).await.unwrap();
        let a = registry.register("cc-main-2025").await.unwrap();
        let b = registry.register("wiki-links").await.unwrap();
        assert_eq!((a, b), (0, 1));

        // Re-registration returns the existing id
        assert_eq!(registry.register("cc-main-2025").await.unwrap(), 0);

        // A fresh load sees the same assignments and continues after them
        let mut reloaded = DatasetRegistry::load(storage).await.unwrap();
        assert_eq!(reloaded.id_of("cc-main-2025"), Some(0));
        assert_eq!(reloaded.id_of("wiki-links"), Some(1));
        assert_eq!(reloaded.register("fresh").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_registry_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        storage
            .put(REGISTRY_KEY, Bytes::from_static(b"{broken"))
            .await
            .unwrap();

        let err = DatasetRegistry::load(storage).await.unwrap_err();
        assert!(matches!(err, Error::FormatInvalid(_)));
    }
}
