//! File registry
//!
//! Assigns a stable small-integer id to every record file ever observed.
//! Ids are dense from 0, never re-numbered and never deleted: a file keeps
//! its id in every later version that still contains it. Persisted as a
//! compressed TSV with one header row.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::compress::Codec;
use crate::storage::StorageBackend;
use crate::types::{DatasetId, FileId, RecordFileInfo};
use crate::{Error, Result};

const HEADER: &str = "file_id\tdataset_id\tdomain_prefix\trelative_path";

/// Stable file-id ↔ record-file mapping.
#[derive(Debug, Default)]
pub struct FileRegistry {
    files: Vec<RecordFileInfo>,
    path_to_id: HashMap<String, FileId>,
}

impl FileRegistry {
    /// Artifact path for a version.
    pub fn artifact_path(version: &str, codec: Codec) -> String {
        format!("index/{}/files.tsv.{}", version, codec.extension())
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Full build: register `paths` in the given enumeration order with ids
    /// `0..N-1`. Paths that do not match the layout are skipped.
    pub fn from_paths(paths: &[String]) -> Self {
        let mut registry = Self::new();
        registry.append_paths(paths);
        registry
    }

    /// Register the not-yet-known paths among `paths`, in their enumeration
    /// order, with ids continuing after the current maximum. Returns the
    /// newly registered files.
    pub fn append_paths(&mut self, paths: &[String]) -> Vec<RecordFileInfo> {
        let mut added = Vec::new();

        for path in paths {
            if self.path_to_id.contains_key(path) {
                continue;
            }
            let Some((dataset_id, domain_prefix)) = parse_partition(path) else {
                tracing::warn!("Record path does not match layout, not registering: {}", path);
                continue;
            };

            let file_id = self.files.len() as FileId;
            let info = RecordFileInfo {
                file_id,
                dataset_id,
                domain_prefix,
                relative_path: path.clone(),
            };
            self.path_to_id.insert(path.clone(), file_id);
            self.files.push(info.clone());
            added.push(info);
        }

        added
    }

    /// Paths among `current` that are not registered yet, in order.
    pub fn unknown_paths(&self, current: &[String]) -> Vec<String> {
        current
            .iter()
            .filter(|path| !self.path_to_id.contains_key(path.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[RecordFileInfo] {
        &self.files
    }

    /// O(1) lookup by file id.
    pub fn file_info(&self, file_id: FileId) -> Option<&RecordFileInfo> {
        self.files.get(file_id as usize)
    }

    /// O(1) lookup by registry-relative path.
    pub fn file_id_of(&self, path: &str) -> Option<FileId> {
        self.path_to_id.get(path).copied()
    }

    pub fn to_tsv(&self) -> String {
        let mut text = String::from(HEADER);
        text.push('\n');
        for file in &self.files {
            text.push_str(&format!(
                "{}\t{}\t{}\t{}\n",
                file.file_id, file.dataset_id, file.domain_prefix, file.relative_path
            ));
        }
        text
    }

    pub fn from_tsv(text: &str) -> Result<Self> {
        let mut lines = text.split('\n').filter(|line| !line.is_empty());

        match lines.next() {
            Some(header) if header == HEADER => {}
            Some(other) => {
                return Err(Error::format_invalid(format!(
                    "unexpected file registry header: {}",
                    other
                )))
            }
            None => return Ok(Self::new()),
        }

        let mut registry = Self::new();
        for line in lines {
            let mut fields = line.split('\t');
            let (Some(id), Some(ds), Some(prefix), Some(path), None) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                return Err(Error::format_invalid(format!(
                    "file registry row has wrong arity: {}",
                    line
                )));
            };

            let file_id: FileId = id
                .parse()
                .map_err(|_| Error::format_invalid(format!("bad file_id: {}", id)))?;
            let dataset_id: DatasetId = ds
                .parse()
                .map_err(|_| Error::format_invalid(format!("bad dataset_id: {}", ds)))?;

            if file_id as usize != registry.files.len() {
                return Err(Error::format_invalid(format!(
                    "file registry ids not dense at {}",
                    file_id
                )));
            }

            registry.path_to_id.insert(path.to_string(), file_id);
            registry.files.push(RecordFileInfo {
                file_id,
                dataset_id,
                domain_prefix: prefix.to_string(),
                relative_path: path.to_string(),
            });
        }

        Ok(registry)
    }

    pub async fn save(
        &self,
        storage: &Arc<dyn StorageBackend>,
        version: &str,
        codec: Codec,
        level: i32,
    ) -> Result<String> {
        let path = Self::artifact_path(version, codec);
        let tsv = self.to_tsv();
        let compressed = codec.compress(tsv.as_bytes(), level)?;
        tracing::info!(
            "Writing file registry to {} ({} files, {} bytes -> {} bytes)",
            path,
            self.files.len(),
            tsv.len(),
            compressed.len()
        );
        storage.put(&path, Bytes::from(compressed)).await?;
        Ok(path)
    }

    pub async fn load(
        storage: &Arc<dyn StorageBackend>,
        path: &str,
        codec: Codec,
    ) -> Result<Self> {
        let compressed = storage.get(path).await?;
        let text = codec.decompress(&compressed)?;
        let text = String::from_utf8(text)
            .map_err(|e| Error::format_invalid(format!("file registry not UTF-8: {}", e)))?;
        Self::from_tsv(&text)
    }
}

/// Extract `(dataset_id, domain_prefix)` from a registry-relative path.
fn parse_partition(path: &str) -> Option<(DatasetId, String)> {
    let mut segments = path.split('/');
    let dataset_id = segments
        .next()?
        .strip_prefix("dataset_id=")?
        .parse()
        .ok()?;
    let prefix = segments.next()?.strip_prefix("domain_prefix=")?;
    if prefix.is_empty() {
        return None;
    }
    Some((dataset_id, prefix.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(ds: u32, prefix: &str, part: u32) -> String {
        format!(
            "dataset_id={}/domain_prefix={}/part-{:05}.parquet",
            ds, prefix, part
        )
    }

    #[test]
    fn test_full_build_assigns_dense_ids() {
        let paths = vec![rel(0, "aa", 0), rel(0, "bb", 0), rel(1, "aa", 0)];
        let registry = FileRegistry::from_paths(&paths);

        assert_eq!(registry.len(), 3);
        for (i, path) in paths.iter().enumerate() {
            assert_eq!(registry.file_id_of(path), Some(i as u32));
            let info = registry.file_info(i as u32).unwrap();
            assert_eq!(info.relative_path, *path);
        }
        assert_eq!(registry.file_info(0).unwrap().dataset_id, 0);
        assert_eq!(registry.file_info(2).unwrap().dataset_id, 1);
        assert_eq!(registry.file_id_of("dataset_id=9/domain_prefix=aa/part-00000.parquet"), None);
    }

    #[test]
    fn test_incremental_keeps_prior_ids() {
        let v1_paths = vec![rel(0, "aa", 0), rel(0, "bb", 0)];
        let mut registry = FileRegistry::from_paths(&v1_paths);

        let v2_paths = vec![rel(0, "aa", 0), rel(0, "aa", 1), rel(0, "bb", 0), rel(1, "cc", 0)];
        let unknown = registry.unknown_paths(&v2_paths);
        assert_eq!(unknown, vec![rel(0, "aa", 1), rel(1, "cc", 0)]);

        let added = registry.append_paths(&unknown);
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].file_id, 2);
        assert_eq!(added[1].file_id, 3);

        // Prior assignments untouched
        assert_eq!(registry.file_id_of(&rel(0, "aa", 0)), Some(0));
        assert_eq!(registry.file_id_of(&rel(0, "bb", 0)), Some(1));
    }

    #[test]
    fn test_tsv_roundtrip() {
        let registry = FileRegistry::from_paths(&[rel(3, "0f", 0), rel(3, "0f", 1)]);
        let tsv = registry.to_tsv();
        assert!(tsv.starts_with("file_id\tdataset_id\tdomain_prefix\trelative_path\n"));

        let loaded = FileRegistry::from_tsv(&tsv).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.file_info(1).unwrap().domain_prefix, "0f");
        assert_eq!(loaded.file_id_of(&rel(3, "0f", 1)), Some(1));
    }

    #[test]
    fn test_bad_header_rejected() {
        let err = FileRegistry::from_tsv("id\tpath\n0\tx\n").unwrap_err();
        assert!(matches!(err, Error::FormatInvalid(_)));
    }

    #[test]
    fn test_non_dense_ids_rejected() {
        let text = format!("{}\n0\t0\taa\t{}\n2\t0\taa\t{}\n", HEADER, rel(0, "aa", 0), rel(0, "aa", 2));
        let err = FileRegistry::from_tsv(&text).unwrap_err();
        assert!(matches!(err, Error::FormatInvalid(_)));
    }
}
