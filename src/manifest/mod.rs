//! Index manifest and versioning
//!
//! The manifest is the single commit point of the system: a small JSON
//! document listing every published version with the relative paths of its
//! artifacts, plus the pointer to the current one. It is rewritten through a
//! temporary sibling and an atomic rename, so readers always observe either
//! the old or the new manifest in full.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::compress::Codec;
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// Canonical manifest location under the base path.
pub const MANIFEST_KEY: &str = "index/manifest.json";

/// One published version and the artifacts it references. Paths are
/// relative to the base directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionEntry {
    pub version: String,
    pub created_at: String,
    pub domains_txt: String,
    pub domains_mphf: String,
    pub d2d_roar: String,
    pub postings_base: String,
    pub files_tsv: String,
    pub parquet_root: String,
    /// Codec the version's compressed artifacts were written with.
    pub codec: Codec,
}

/// The manifest document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Manifest {
    pub current_version: Option<String>,
    /// Shard count of the postings index; fixed for the base path at first
    /// publish, rebuilds with another value are rejected.
    pub num_shards: Option<u32>,
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
}

impl Manifest {
    pub fn get_version(&self, version: &str) -> Option<&VersionEntry> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn current(&self) -> Option<&VersionEntry> {
        self.current_version
            .as_deref()
            .and_then(|version| self.get_version(version))
    }

    /// Add a version, replacing any entry with the same identifier.
    pub fn add_version(&mut self, entry: VersionEntry) {
        self.versions.retain(|v| v.version != entry.version);
        self.versions.push(entry);
    }

    /// Flip the current pointer to an existing version.
    pub fn set_current(&mut self, version: &str) -> Result<()> {
        if self.get_version(version).is_none() {
            return Err(Error::version_corrupt(format!(
                "version {} not present in manifest",
                version
            )));
        }
        let previous = self.current_version.replace(version.to_string());
        tracing::info!("Current version: {:?} -> {}", previous, version);
        Ok(())
    }

    /// Trim the version list to the `n` most recently created entries. The
    /// current version is always retained. Returns the identifiers removed;
    /// artifact deletion is a separate step.
    pub fn keep_last_n(&mut self, n: usize) -> Vec<String> {
        if self.versions.len() <= n {
            return Vec::new();
        }

        let mut sorted: Vec<VersionEntry> = self.versions.clone();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut keep: Vec<VersionEntry> = sorted.iter().take(n).cloned().collect();
        if let Some(current) = self.current() {
            if !keep.iter().any(|v| v.version == current.version) {
                keep.push(current.clone());
            }
        }

        let removed: Vec<String> = self
            .versions
            .iter()
            .filter(|v| !keep.iter().any(|k| k.version == v.version))
            .map(|v| v.version.clone())
            .collect();

        self.versions.retain(|v| keep.iter().any(|k| k.version == v.version));
        tracing::info!("Retired {} versions: {:?}", removed.len(), removed);
        removed
    }
}

/// Loads and atomically saves the manifest.
pub struct ManifestStore {
    storage: Arc<dyn StorageBackend>,
}

impl ManifestStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Load the manifest; a base path without one yields the empty manifest.
    pub async fn load(&self) -> Result<Manifest> {
        if !self.storage.exists(MANIFEST_KEY).await? {
            return Ok(Manifest::default());
        }

        let data = self.storage.get(MANIFEST_KEY).await?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::format_invalid(format!("manifest unreadable: {}", e)))
    }

    /// Atomic save: write a temporary sibling, then rename over the
    /// canonical path.
    pub async fn save(&self, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;

        let temp_key = format!("{}.tmp", MANIFEST_KEY);
        self.storage.put(&temp_key, Bytes::from(json)).await?;
        self.storage.rename(&temp_key, MANIFEST_KEY).await?;

        tracing::info!(
            "Saved manifest: {} versions, current={:?}",
            manifest.versions.len(),
            manifest.current_version
        );
        Ok(())
    }

    /// Delete `index/<version>/` trees that no manifest entry references.
    /// Idempotent; safe to re-run after a crash mid-sweep.
    pub async fn sweep_unreferenced(&self, manifest: &Manifest) -> Result<Vec<String>> {
        let keys = self.storage.list("index").await?;

        let mut removed = Vec::new();
        for key in keys {
            if key == MANIFEST_KEY || key == format!("{}.tmp", MANIFEST_KEY) {
                continue;
            }
            let Some(rest) = key.strip_prefix("index/") else {
                continue;
            };
            let Some((version, _)) = rest.split_once('/') else {
                continue;
            };
            if manifest.get_version(version).is_none() {
                self.storage.delete(&key).await?;
                if !removed.contains(&version.to_string()) {
                    tracing::info!("Sweeping artifacts of retired version {}", version);
                    removed.push(version.to_string());
                }
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use tempfile::TempDir;

    fn entry(version: &str, created_at: &str) -> VersionEntry {
        VersionEntry {
            version: version.to_string(),
            created_at: created_at.to_string(),
            domains_txt: format!("index/{}/domains.txt.zst", version),
            domains_mphf: format!("index/{}/domains.mphf", version),
            d2d_roar: format!("index/{}/domain_to_datasets.roar", version),
            postings_base: format!("index/{}/postings", version),
            files_tsv: format!("index/{}/files.tsv.zst", version),
            parquet_root: "urls/".to_string(),
            codec: Codec::Zstd,
        }
    }

    #[test]
    fn test_set_current_requires_known_version() {
        let mut manifest = Manifest::default();
        assert!(manifest.set_current("v1").is_err());

        manifest.add_version(entry("v1", "2026-01-01T00:00:00Z"));
        manifest.set_current("v1").unwrap();
        assert_eq!(manifest.current().unwrap().version, "v1");
    }

    #[test]
    fn test_keep_last_n_retains_current() {
        let mut manifest = Manifest::default();
        for (v, t) in [
            ("v1", "2026-01-01T00:00:00Z"),
            ("v2", "2026-01-02T00:00:00Z"),
            ("v3", "2026-01-03T00:00:00Z"),
        ] {
            manifest.add_version(entry(v, t));
        }
        manifest.set_current("v1").unwrap();

        let removed = manifest.keep_last_n(1);
        assert_eq!(removed, vec!["v2".to_string()]);
        assert!(manifest.get_version("v3").is_some());
        assert!(manifest.get_version("v1").is_some());
        assert_eq!(manifest.current().unwrap().version, "v1");
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let store = ManifestStore::new(storage.clone());

        assert!(store.load().await.unwrap().versions.is_empty());

        let mut manifest = Manifest::default();
        manifest.num_shards = Some(1024);
        manifest.add_version(entry("v1", "2026-01-01T00:00:00Z"));
        manifest.set_current("v1").unwrap();
        store.save(&manifest).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.current_version.as_deref(), Some("v1"));
        assert_eq!(loaded.num_shards, Some(1024));
        assert_eq!(loaded.versions, manifest.versions);

        // No temp residue after the rename
        assert!(!storage
            .exists(&format!("{}.tmp", MANIFEST_KEY))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sweep_unreferenced() {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let store = ManifestStore::new(storage.clone());

        let mut manifest = Manifest::default();
        manifest.add_version(entry("v2", "2026-01-02T00:00:00Z"));
        manifest.set_current("v2").unwrap();
        store.save(&manifest).await.unwrap();

        storage
            .put("index/v1/domains.txt.zst", Bytes::from_static(b"old"))
            .await
            .unwrap();
        storage
            .put("index/v2/domains.txt.zst", Bytes::from_static(b"live"))
            .await
            .unwrap();

        let removed = store.sweep_unreferenced(&manifest).await.unwrap();
        assert_eq!(removed, vec!["v1".to_string()]);
        assert!(!storage.exists("index/v1/domains.txt.zst").await.unwrap());
        assert!(storage.exists("index/v2/domains.txt.zst").await.unwrap());
        assert!(storage.exists(MANIFEST_KEY).await.unwrap());

        // Idempotent
        assert!(store.sweep_unreferenced(&manifest).await.unwrap().is_empty());
    }
}
