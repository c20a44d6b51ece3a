//! Domain → datasets membership index
//!
//! One compressed integer set per domain, dense over domain ids 0..N-1.
//! On-disk container:
//!
//! ```text
//! [magic "DTDR"][version:u32][N_domains:u64][index_offset:u64]
//! [bitmap payloads concatenated]
//! [N_domains x (bitmap_start:u64, bitmap_len:u32)]
//! ```
//!
//! `bitmap_start` is absolute from file start. Domains without memberships
//! hold an empty bitmap.

use std::sync::Arc;

use bytes::Bytes;
use roaring::RoaringBitmap;

use crate::index::ByteReader;
use crate::storage::StorageBackend;
use crate::types::{DatasetId, DomainId};
use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"DTDR";
const FORMAT_VERSION: u32 = 1;

/// Per-domain dataset membership bitmaps.
#[derive(Debug)]
pub struct MembershipIndex {
    bitmaps: Vec<RoaringBitmap>,
}

impl MembershipIndex {
    /// Artifact path for a version.
    pub fn artifact_path(version: &str) -> String {
        format!("index/{}/domain_to_datasets.roar", version)
    }

    /// An index over `num_domains` domains with no memberships yet.
    pub fn new(num_domains: usize) -> Self {
        Self {
            bitmaps: vec![RoaringBitmap::new(); num_domains],
        }
    }

    /// Grow to cover `num_domains` domains; existing positions keep their
    /// bitmaps. Domain ids are stable, so carried-over positions stay valid.
    pub fn extend_to(&mut self, num_domains: usize) {
        if num_domains > self.bitmaps.len() {
            self.bitmaps.resize_with(num_domains, RoaringBitmap::new);
        }
    }

    pub fn num_domains(&self) -> usize {
        self.bitmaps.len()
    }

    /// Record that `dataset_id` contains `domain_id`.
    pub fn add(&mut self, domain_id: DomainId, dataset_id: DatasetId) {
        let index = domain_id as usize;
        if index >= self.bitmaps.len() {
            self.extend_to(index + 1);
        }
        self.bitmaps[index].insert(dataset_id);
    }

    /// Ascending dataset ids containing the domain; empty if out of range.
    pub fn datasets_for(&self, domain_id: DomainId) -> Vec<DatasetId> {
        self.bitmaps
            .get(domain_id as usize)
            .map(|bitmap| bitmap.iter().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, domain_id: DomainId, dataset_id: DatasetId) -> bool {
        self.bitmaps
            .get(domain_id as usize)
            .is_some_and(|bitmap| bitmap.contains(dataset_id))
    }

    /// Total number of (domain, dataset) membership pairs.
    pub fn pair_count(&self) -> u64 {
        self.bitmaps.iter().map(|bitmap| bitmap.len()).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        data.extend_from_slice(&(self.bitmaps.len() as u64).to_le_bytes());
        let index_offset_pos = data.len();
        data.extend_from_slice(&0u64.to_le_bytes());

        let mut index_entries = Vec::with_capacity(self.bitmaps.len());
        for bitmap in &self.bitmaps {
            let start = data.len() as u64;
            bitmap
                .serialize_into(&mut data)
                .map_err(|e| Error::internal(format!("bitmap serialization failed: {}", e)))?;
            let len = data.len() as u64 - start;
            index_entries.push((start, len as u32));
        }

        let index_offset = data.len() as u64;
        data[index_offset_pos..index_offset_pos + 8].copy_from_slice(&index_offset.to_le_bytes());

        for (start, len) in index_entries {
            data.extend_from_slice(&start.to_le_bytes());
            data.extend_from_slice(&len.to_le_bytes());
        }

        Ok(data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        reader.expect_magic(MAGIC, "membership index")?;

        let version = reader.read_u32("membership version")?;
        if version != FORMAT_VERSION {
            return Err(Error::format_invalid(format!(
                "unsupported membership index version: {}",
                version
            )));
        }

        let num_domains = reader.read_u64("membership domain count")? as usize;
        let index_offset = reader.read_u64("membership index offset")? as usize;

        if index_offset > data.len() {
            return Err(Error::format_invalid(
                "membership index offset beyond end of file",
            ));
        }
        reader.seek(index_offset);

        let mut bitmaps = Vec::with_capacity(num_domains);
        for domain_id in 0..num_domains {
            let start = reader.read_u64("bitmap start")? as usize;
            let len = reader.read_u32("bitmap length")? as usize;

            let end = start.checked_add(len).filter(|&end| end <= data.len());
            let Some(end) = end else {
                return Err(Error::format_invalid(format!(
                    "bitmap bounds out of range for domain {}",
                    domain_id
                )));
            };

            let bitmap = if len == 0 {
                RoaringBitmap::new()
            } else {
                RoaringBitmap::deserialize_from(&data[start..end]).map_err(|e| {
                    Error::format_invalid(format!("bitmap for domain {} invalid: {}", domain_id, e))
                })?
            };
            bitmaps.push(bitmap);
        }

        Ok(Self { bitmaps })
    }

    pub async fn save(&self, storage: &Arc<dyn StorageBackend>, version: &str) -> Result<String> {
        let path = Self::artifact_path(version);
        let bytes = self.to_bytes()?;
        tracing::info!(
            "Writing membership index to {} ({} domains, {} pairs, {} bytes)",
            path,
            self.num_domains(),
            self.pair_count(),
            bytes.len()
        );
        storage.put(&path, Bytes::from(bytes)).await?;
        Ok(path)
    }

    pub async fn load(
        storage: &Arc<dyn StorageBackend>,
        path: &str,
        expected_domains: usize,
    ) -> Result<Self> {
        let data = storage.get(path).await?;
        let index = Self::from_bytes(&data)?;

        if index.num_domains() != expected_domains {
            return Err(Error::format_invalid(format!(
                "membership index covers {} domains, dictionary has {}",
                index.num_domains(),
                expected_domains
            )));
        }

        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_empty_bitmaps() {
        let mut index = MembershipIndex::new(4);
        index.add(0, 3);
        index.add(0, 1);
        index.add(2, 7);
        // domain 1 and 3 intentionally left without memberships

        let bytes = index.to_bytes().unwrap();
        let loaded = MembershipIndex::from_bytes(&bytes).unwrap();

        assert_eq!(loaded.num_domains(), 4);
        assert_eq!(loaded.datasets_for(0), vec![1, 3]);
        assert_eq!(loaded.datasets_for(1), Vec::<u32>::new());
        assert_eq!(loaded.datasets_for(2), vec![7]);
        assert_eq!(loaded.datasets_for(99), Vec::<u32>::new());
        assert!(loaded.contains(0, 3));
        assert!(!loaded.contains(0, 2));
        assert_eq!(loaded.pair_count(), 3);
    }

    #[test]
    fn test_extend_keeps_positions() {
        let mut index = MembershipIndex::new(2);
        index.add(1, 5);
        index.extend_to(5);

        assert_eq!(index.num_domains(), 5);
        assert_eq!(index.datasets_for(1), vec![5]);
        assert_eq!(index.datasets_for(4), Vec::<u32>::new());
    }

    #[test]
    fn test_corrupt_magic_rejected() {
        let mut index = MembershipIndex::new(1);
        index.add(0, 0);
        let mut bytes = index.to_bytes().unwrap();
        bytes[0] ^= 0xff;

        let err = MembershipIndex::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::FormatInvalid(_)));
    }

    #[test]
    fn test_truncated_rejected() {
        let mut index = MembershipIndex::new(2);
        index.add(0, 1);
        index.add(1, 2);
        let bytes = index.to_bytes().unwrap();

        let err = MembershipIndex::from_bytes(&bytes[..bytes.len() - 5]).unwrap_err();
        assert!(matches!(err, Error::FormatInvalid(_)));
    }
}
