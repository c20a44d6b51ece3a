//! Postings index
//!
//! Maps `(domain_id, dataset_id)` to the row groups that may contain the
//! domain's rows. Entries are sharded by `domain_id mod num_shards`; each
//! shard is a pair of compressed files:
//!
//! - `postings.idx`: header `PDX1`, version, entry count, dat header size,
//!   then fixed 24-byte records sorted by `(domain_id, dataset_id)`.
//! - `postings.dat`: header `PDD1`, version, then concatenated varint
//!   payloads; payload offsets in the idx are absolute into the dat file.
//!
//! A payload is a varint count followed by `(file_id, row_group)` varint
//! pairs, ascending and deduplicated.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lru::LruCache;

use crate::compress::Codec;
use crate::index::ByteReader;
use crate::storage::StorageBackend;
use crate::types::{DatasetId, DomainId, FileId};
use crate::{Error, Result};

const MAGIC_IDX: &[u8; 4] = b"PDX1";
const MAGIC_DAT: &[u8; 4] = b"PDD1";
const FORMAT_VERSION: u32 = 1;
/// Bytes of the dat header preceding the first payload (magic + version).
const DAT_HEADER_SIZE: u64 = 8;

/// Shard selector.
pub fn shard_of(domain_id: DomainId, num_shards: u32) -> u32 {
    domain_id % num_shards
}

/// Postings base directory of a version.
pub fn base_path(version: &str) -> String {
    format!("index/{}/postings", version)
}

fn idx_key(base: &str, shard: u32, codec: Codec) -> String {
    format!("{}/{:04}/postings.idx.{}", base, shard, codec.extension())
}

fn dat_key(base: &str, shard: u32, codec: Codec) -> String {
    format!("{}/{:04}/postings.dat.{}", base, shard, codec.extension())
}

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
}

fn decode_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| Error::format_invalid("truncated varint in postings payload"))?;
        *pos += 1;
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::format_invalid("varint overflows 64 bits"));
        }
    }
}

/// Accumulates postings during a build and writes the shard files.
#[derive(Default)]
pub struct PostingsBuilder {
    entries: BTreeMap<(DomainId, DatasetId), BTreeSet<(FileId, u32)>>,
}

impl PostingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a locator; duplicates collapse.
    pub fn add(&mut self, domain_id: DomainId, dataset_id: DatasetId, file_id: FileId, row_group: u32) {
        self.entries
            .entry((domain_id, dataset_id))
            .or_default()
            .insert((file_id, row_group));
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Carry over every posting of a previous version. File ids are stable,
    /// so locators merge position-identically.
    pub async fn load_previous(
        &mut self,
        storage: &Arc<dyn StorageBackend>,
        base: &str,
        codec: Codec,
        num_shards: u32,
    ) -> Result<()> {
        for shard_no in 0..num_shards {
            let idx = idx_key(base, shard_no, codec);
            if !storage.exists(&idx).await? {
                continue;
            }
            let shard = load_shard(storage, base, shard_no, codec).await?;
            for entry in &shard.entries {
                let domain_id = DomainId::try_from(entry.domain_id).map_err(|_| {
                    Error::format_invalid(format!(
                        "postings domain id {} exceeds u32",
                        entry.domain_id
                    ))
                })?;
                let locators = shard.decode_payload(entry)?;
                self.entries
                    .entry((domain_id, entry.dataset_id))
                    .or_default()
                    .extend(locators);
            }
        }
        Ok(())
    }

    /// Write all shard files for `version`, returning the base directory.
    pub async fn save(
        &self,
        storage: &Arc<dyn StorageBackend>,
        version: &str,
        codec: Codec,
        level: i32,
        num_shards: u32,
    ) -> Result<String> {
        let base = base_path(version);

        let mut shards: BTreeMap<u32, Vec<(&(DomainId, DatasetId), &BTreeSet<(FileId, u32)>)>> =
            BTreeMap::new();
        for (key, locators) in &self.entries {
            shards
                .entry(shard_of(key.0, num_shards))
                .or_default()
                .push((key, locators));
        }

        let mut written = 0usize;
        for (shard_no, entries) in &shards {
            let mut dat = Vec::new();
            dat.extend_from_slice(MAGIC_DAT);
            dat.extend_from_slice(&FORMAT_VERSION.to_le_bytes());

            let mut idx = Vec::new();
            idx.extend_from_slice(MAGIC_IDX);
            idx.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
            idx.extend_from_slice(&(entries.len() as u64).to_le_bytes());
            idx.extend_from_slice(&DAT_HEADER_SIZE.to_le_bytes());

            for ((domain_id, dataset_id), locators) in entries {
                let mut payload = Vec::new();
                encode_varint(locators.len() as u64, &mut payload);
                for (file_id, row_group) in locators.iter() {
                    encode_varint(u64::from(*file_id), &mut payload);
                    encode_varint(u64::from(*row_group), &mut payload);
                }

                let payload_offset = dat.len() as u64;
                dat.extend_from_slice(&payload);

                idx.extend_from_slice(&u64::from(*domain_id).to_le_bytes());
                idx.extend_from_slice(&dataset_id.to_le_bytes());
                idx.extend_from_slice(&payload_offset.to_le_bytes());
                idx.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            }

            storage
                .put(
                    &idx_key(&base, *shard_no, codec),
                    Bytes::from(codec.compress(&idx, level)?),
                )
                .await?;
            storage
                .put(
                    &dat_key(&base, *shard_no, codec),
                    Bytes::from(codec.compress(&dat, level)?),
                )
                .await?;

            tracing::debug!("Shard {:04}: {} posting entries", shard_no, entries.len());
            written += 1;
        }

        tracing::info!(
            "Wrote postings under {}: {} entries across {} shards",
            base,
            self.entries.len(),
            written
        );
        Ok(base)
    }
}

#[derive(Debug, Clone, Copy)]
struct IdxEntry {
    domain_id: u64,
    dataset_id: DatasetId,
    payload_offset: u64,
    payload_len: u32,
}

/// One decoded shard held in memory.
pub struct PostingsShard {
    entries: Vec<IdxEntry>,
    dat: Vec<u8>,
}

impl PostingsShard {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            dat: Vec::new(),
        }
    }

    fn from_parts(idx: &[u8], dat: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(idx);
        reader.expect_magic(MAGIC_IDX, "postings idx")?;
        let version = reader.read_u32("postings idx version")?;
        if version != FORMAT_VERSION {
            return Err(Error::format_invalid(format!(
                "unsupported postings idx version: {}",
                version
            )));
        }
        let n_entries = reader.read_u64("postings entry count")?;
        let _dat_header_size = reader.read_u64("postings dat header size")?;

        let mut entries = Vec::with_capacity(n_entries as usize);
        for _ in 0..n_entries {
            entries.push(IdxEntry {
                domain_id: reader.read_u64("posting domain id")?,
                dataset_id: reader.read_u32("posting dataset id")?,
                payload_offset: reader.read_u64("payload offset")?,
                payload_len: reader.read_u32("payload length")?,
            });
        }

        let mut dat_reader = ByteReader::new(dat);
        dat_reader.expect_magic(MAGIC_DAT, "postings dat")?;
        let dat_version = dat_reader.read_u32("postings dat version")?;
        if dat_version != FORMAT_VERSION {
            return Err(Error::format_invalid(format!(
                "unsupported postings dat version: {}",
                dat_version
            )));
        }

        Ok(Self {
            entries,
            dat: dat.to_vec(),
        })
    }

    fn decode_payload(&self, entry: &IdxEntry) -> Result<Vec<(FileId, u32)>> {
        let start = entry.payload_offset as usize;
        let end = start
            .checked_add(entry.payload_len as usize)
            .filter(|&end| end <= self.dat.len())
            .ok_or_else(|| Error::format_invalid("postings payload out of bounds"))?;
        let payload = &self.dat[start..end];

        let mut pos = 0usize;
        let count = decode_varint(payload, &mut pos)?;
        let mut locators = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let file_id = decode_varint(payload, &mut pos)?;
            let row_group = decode_varint(payload, &mut pos)?;
            let file_id = FileId::try_from(file_id)
                .map_err(|_| Error::format_invalid("posting file id exceeds u32"))?;
            let row_group = u32::try_from(row_group)
                .map_err(|_| Error::format_invalid("posting row group exceeds u32"))?;
            locators.push((file_id, row_group));
        }

        Ok(locators)
    }

    fn get(&self, domain_id: DomainId, dataset_id: DatasetId) -> Result<Option<Vec<(FileId, u32)>>> {
        let target = (u64::from(domain_id), dataset_id);
        match self
            .entries
            .binary_search_by(|e| (e.domain_id, e.dataset_id).cmp(&target))
        {
            Ok(index) => Ok(Some(self.decode_payload(&self.entries[index])?)),
            Err(_) => Ok(None),
        }
    }
}

async fn load_shard(
    storage: &Arc<dyn StorageBackend>,
    base: &str,
    shard_no: u32,
    codec: Codec,
) -> Result<PostingsShard> {
    let idx = codec.decompress(&storage.get(&idx_key(base, shard_no, codec)).await?)?;
    let dat = codec.decompress(&storage.get(&dat_key(base, shard_no, codec)).await?)?;
    PostingsShard::from_parts(&idx, &dat)
}

/// Query-side shard access with a bounded lazy cache.
pub struct PostingsReader {
    storage: Arc<dyn StorageBackend>,
    base: String,
    codec: Codec,
    num_shards: u32,
    shards: Mutex<LruCache<u32, Arc<PostingsShard>>>,
}

impl PostingsReader {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        base: String,
        codec: Codec,
        num_shards: u32,
        cache_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        Self {
            storage,
            base,
            codec,
            num_shards,
            shards: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Locators for a `(domain_id, dataset_id)` pair, ascending by
    /// `(file_id, row_group)`. Loads at most one shard.
    pub async fn lookup(
        &self,
        domain_id: DomainId,
        dataset_id: DatasetId,
    ) -> Result<Vec<(FileId, u32)>> {
        let shard = self.shard(shard_of(domain_id, self.num_shards)).await?;
        Ok(shard.get(domain_id, dataset_id)?.unwrap_or_default())
    }

    async fn shard(&self, shard_no: u32) -> Result<Arc<PostingsShard>> {
        if let Some(shard) = self.shards.lock().unwrap().get(&shard_no) {
            return Ok(shard.clone());
        }

        let shard = if self
            .storage
            .exists(&idx_key(&self.base, shard_no, self.codec))
            .await?
        {
            Arc::new(load_shard(&self.storage, &self.base, shard_no, self.codec).await?)
        } else {
            // Shards with no entries are simply absent.
            Arc::new(PostingsShard::empty())
        };

        self.shards.lock().unwrap().put(shard_no, shard.clone());
        Ok(shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;
    use tempfile::TempDir;

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            let mut pos = 0;
            assert_eq!(decode_varint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_varint_truncation_rejected() {
        let mut buf = Vec::new();
        encode_varint(300, &mut buf);
        let mut pos = 0;
        assert!(decode_varint(&buf[..1], &mut pos).is_err());
    }

    fn reader_for(
        storage: Arc<LocalStorage>,
        version: &str,
        num_shards: u32,
    ) -> PostingsReader {
        PostingsReader::new(storage, base_path(version), Codec::Zstd, num_shards, 64)
    }

    #[tokio::test]
    async fn test_build_save_lookup() {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(temp_dir.path()).unwrap());

        let mut builder = PostingsBuilder::new();
        // Out-of-order and duplicated inserts must come back sorted, deduped
        builder.add(5, 1, 3, 2);
        builder.add(5, 1, 3, 2);
        builder.add(5, 1, 0, 0);
        builder.add(5, 1, 3, 1);
        builder.add(6, 0, 1, 0);
        builder.add(1029, 2, 9, 4);

        builder
            .save(&storage, "v1", Codec::Zstd, 6, 1024)
            .await
            .unwrap();

        let local = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let reader = reader_for(local, "v1", 1024);

        assert_eq!(
            reader.lookup(5, 1).await.unwrap(),
            vec![(0, 0), (3, 1), (3, 2)]
        );
        assert_eq!(reader.lookup(6, 0).await.unwrap(), vec![(1, 0)]);
        // 1029 mod 1024 = 5: lands in the same shard as domain 5
        assert_eq!(reader.lookup(1029, 2).await.unwrap(), vec![(9, 4)]);
        // Absent pair and absent shard both resolve to empty
        assert_eq!(reader.lookup(5, 9).await.unwrap(), Vec::<(u32, u32)>::new());
        assert_eq!(reader.lookup(7, 0).await.unwrap(), Vec::<(u32, u32)>::new());
    }

    #[tokio::test]
    async fn test_load_previous_preserves_locators() {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(temp_dir.path()).unwrap());

        let mut v1 = PostingsBuilder::new();
        v1.add(0, 0, 0, 0);
        v1.add(3, 1, 1, 2);
        v1.save(&storage, "v1", Codec::Zstd, 6, 8).await.unwrap();

        let mut v2 = PostingsBuilder::new();
        v2.load_previous(&storage, &base_path("v1"), Codec::Zstd, 8)
            .await
            .unwrap();
        v2.add(3, 1, 5, 0);
        v2.save(&storage, "v2", Codec::Zstd, 6, 8).await.unwrap();

        let local = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let reader = reader_for(local, "v2", 8);
        assert_eq!(reader.lookup(0, 0).await.unwrap(), vec![(0, 0)]);
        assert_eq!(reader.lookup(3, 1).await.unwrap(), vec![(1, 2), (5, 0)]);
    }

    #[tokio::test]
    async fn test_corrupt_idx_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(temp_dir.path()).unwrap());

        let mut builder = PostingsBuilder::new();
        builder.add(0, 0, 0, 0);
        builder.save(&storage, "v1", Codec::Zstd, 6, 4).await.unwrap();

        // Valid compression around a broken header
        let key = idx_key(&base_path("v1"), 0, Codec::Zstd);
        let garbage = Codec::Zstd.compress(b"XXXXGARBAGE", 6).unwrap();
        storage.put(&key, Bytes::from(garbage)).await.unwrap();

        let local = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let reader = reader_for(local, "v1", 4);
        let err = reader.lookup(0, 0).await.unwrap_err();
        assert!(matches!(err, Error::FormatInvalid(_)));
    }
}
