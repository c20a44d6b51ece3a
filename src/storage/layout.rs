//! Partitioned record-file layout
//!
//! Record files live under a fixed two-level Hive-style partitioning:
//!
//! ```text
//! urls/
//!   dataset_id={id}/
//!     domain_prefix={hh}/
//!       part-00000.parquet
//!       part-00001.parquet
//! ```
//!
//! The layout never writes; it maps coordinates to paths and enumerates what
//! exists. Malformed partition directories are skipped silently.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::storage::StorageBackend;
use crate::types::DatasetId;
use crate::Result;

/// Root directory of the record-file tree, relative to the base path.
pub const URLS_ROOT: &str = "urls";

/// Extension of record files.
pub const RECORD_EXT: &str = "parquet";

/// Path scheme and enumeration over the partitioned record store.
pub struct StorageLayout {
    storage: Arc<dyn StorageBackend>,
    prefix_chars: usize,
}

impl StorageLayout {
    pub fn new(storage: Arc<dyn StorageBackend>, prefix_chars: usize) -> Self {
        Self {
            storage,
            prefix_chars,
        }
    }

    /// Storage key of a partition directory.
    pub fn partition_dir(dataset_id: DatasetId, prefix: &str) -> String {
        format!(
            "{}/dataset_id={}/domain_prefix={}",
            URLS_ROOT, dataset_id, prefix
        )
    }

    /// Storage key of a record file.
    pub fn record_path(dataset_id: DatasetId, prefix: &str, part_number: u32) -> String {
        format!(
            "{}/part-{:05}.{}",
            Self::partition_dir(dataset_id, prefix),
            part_number,
            RECORD_EXT
        )
    }

    /// Record-file path relative to [`URLS_ROOT`], as stored in the file
    /// registry.
    pub fn relative_record_path(dataset_id: DatasetId, prefix: &str, part_number: u32) -> String {
        format!(
            "dataset_id={}/domain_prefix={}/part-{:05}.{}",
            dataset_id, prefix, part_number, RECORD_EXT
        )
    }

    /// Full storage key for a registry-relative record path.
    pub fn record_key(relative_path: &str) -> String {
        format!("{}/{}", URLS_ROOT, relative_path)
    }

    /// Parse a registry-relative record path into its coordinates.
    ///
    /// Returns `None` for anything that does not match the layout exactly.
    pub fn parse_relative_path(&self, path: &str) -> Option<(DatasetId, String, u32)> {
        let mut segments = path.split('/');
        let dataset_dir = segments.next()?;
        let prefix_dir = segments.next()?;
        let file_name = segments.next()?;
        if segments.next().is_some() {
            return None;
        }

        let dataset_id: DatasetId = dataset_dir.strip_prefix("dataset_id=")?.parse().ok()?;

        let prefix = prefix_dir.strip_prefix("domain_prefix=")?;
        if prefix.len() != self.prefix_chars
            || !prefix
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return None;
        }

        let part = file_name
            .strip_prefix("part-")?
            .strip_suffix(&format!(".{}", RECORD_EXT))?;
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let part_number: u32 = part.parse().ok()?;
        // Only the canonical zero-padded spelling round-trips.
        if part != format!("{:05}", part_number) {
            return None;
        }

        Some((dataset_id, prefix.to_string(), part_number))
    }

    /// Enumerate existing record files as registry-relative paths, sorted by
    /// `(dataset_id, domain_prefix, part_number)`.
    pub async fn list_record_files(&self) -> Result<Vec<String>> {
        let keys = self.storage.list(URLS_ROOT).await?;
        let root_prefix = format!("{}/", URLS_ROOT);

        let mut files: Vec<(DatasetId, String, u32)> = Vec::new();
        for key in keys {
            let Some(relative) = key.strip_prefix(&root_prefix) else {
                continue;
            };
            if let Some(coords) = self.parse_relative_path(relative) {
                files.push(coords);
            } else {
                tracing::debug!("Skipping non-record path: {}", key);
            }
        }

        files.sort();
        Ok(files
            .into_iter()
            .map(|(ds, prefix, part)| Self::relative_record_path(ds, &prefix, part))
            .collect())
    }

    /// Enumerate `(dataset_id, domain_prefix)` partitions, sorted, optionally
    /// restricted to one dataset.
    pub async fn list_partitions(
        &self,
        dataset_id: Option<DatasetId>,
    ) -> Result<Vec<(DatasetId, String)>> {
        let files = self.list_record_files().await?;

        let mut partitions = BTreeSet::new();
        for relative in &files {
            if let Some((ds, prefix, _)) = self.parse_relative_path(relative) {
                if dataset_id.is_none() || dataset_id == Some(ds) {
                    partitions.insert((ds, prefix));
                }
            }
        }

        Ok(partitions.into_iter().collect())
    }

    /// Record files of one partition, sorted by part number, as
    /// registry-relative paths.
    pub async fn list_files(&self, dataset_id: DatasetId, prefix: &str) -> Result<Vec<String>> {
        let files = self.list_record_files().await?;

        let mut parts: Vec<u32> = files
            .iter()
            .filter_map(|relative| self.parse_relative_path(relative))
            .filter(|(ds, p, _)| *ds == dataset_id && p == prefix)
            .map(|(_, _, part)| part)
            .collect();
        parts.sort_unstable();

        Ok(parts
            .into_iter()
            .map(|part| Self::relative_record_path(dataset_id, prefix, part))
            .collect())
    }

    /// Next part number for a partition: `max(existing) + 1`, or 0.
    pub async fn next_part_number(&self, dataset_id: DatasetId, prefix: &str) -> Result<u32> {
        let files = self.list_files(dataset_id, prefix).await?;

        let max = files
            .iter()
            .filter_map(|relative| self.parse_relative_path(relative))
            .map(|(_, _, part)| part)
            .max();

        Ok(max.map_or(0, |m| m + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn touch(storage: &LocalStorage, key: &str) {
        storage.put(key, Bytes::from_static(b"x")).await.unwrap();
    }

    fn layout(storage: Arc<LocalStorage>) -> StorageLayout {
        StorageLayout::new(storage, 2)
    }

    #[test]
    fn test_path_scheme() {
        assert_eq!(
            StorageLayout::partition_dir(17, "3a"),
            "urls/dataset_id=17/domain_prefix=3a"
        );
        assert_eq!(
            StorageLayout::record_path(17, "3a", 0),
            "urls/dataset_id=17/domain_prefix=3a/part-00000.parquet"
        );
        assert_eq!(
            StorageLayout::relative_record_path(17, "3a", 12),
            "dataset_id=17/domain_prefix=3a/part-00012.parquet"
        );
    }

    #[tokio::test]
    async fn test_enumeration_skips_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());

        touch(&storage, "urls/dataset_id=2/domain_prefix=ab/part-00000.parquet").await;
        touch(&storage, "urls/dataset_id=2/domain_prefix=ab/part-00001.parquet").await;
        touch(&storage, "urls/dataset_id=10/domain_prefix=ff/part-00000.parquet").await;
        // Malformed entries of various kinds
        touch(&storage, "urls/dataset_id=oops/domain_prefix=ab/part-00000.parquet").await;
        touch(&storage, "urls/dataset_id=3/domain_prefix=ABC/part-00000.parquet").await;
        touch(&storage, "urls/dataset_id=3/domain_prefix=ab/part-x.parquet").await;
        touch(&storage, "urls/dataset_id=3/domain_prefix=ab/notes.txt").await;

        let layout = layout(storage);

        let files = layout.list_record_files().await.unwrap();
        assert_eq!(
            files,
            vec![
                "dataset_id=2/domain_prefix=ab/part-00000.parquet",
                "dataset_id=2/domain_prefix=ab/part-00001.parquet",
                "dataset_id=10/domain_prefix=ff/part-00000.parquet",
            ]
        );

        let partitions = layout.list_partitions(None).await.unwrap();
        assert_eq!(
            partitions,
            vec![(2, "ab".to_string()), (10, "ff".to_string())]
        );

        let only_ds2 = layout.list_partitions(Some(2)).await.unwrap();
        assert_eq!(only_ds2, vec![(2, "ab".to_string())]);
    }

    #[tokio::test]
    async fn test_next_part_number() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let layout = layout(storage.clone());

        assert_eq!(layout.next_part_number(5, "aa").await.unwrap(), 0);

        touch(&storage, "urls/dataset_id=5/domain_prefix=aa/part-00000.parquet").await;
        touch(&storage, "urls/dataset_id=5/domain_prefix=aa/part-00004.parquet").await;

        assert_eq!(layout.next_part_number(5, "aa").await.unwrap(), 5);
    }
}
