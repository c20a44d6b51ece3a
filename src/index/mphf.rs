//! Domain hash index
//!
//! Maps a domain string to its position in the domain dictionary in
//! expected O(1) time without holding the dictionary itself. Two levels: a
//! primary `hash64 -> id` table, and a collision map for the rare hashes
//! shared by more than one domain. A hash never lives in both levels, which
//! makes the verification-free primary lookup sound: a hash that is absent
//! from both levels was not in the build set.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::compress::Codec;
use crate::index::ByteReader;
use crate::storage::StorageBackend;
use crate::types::{hash64, DomainId};
use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"MPHF";
const FORMAT_VERSION: u32 = 1;

type Hasher = fn(&str) -> u64;

fn tag16(hash: u64) -> u16 {
    (hash >> 48) as u16
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CollisionEntry {
    tag: u16,
    domain: String,
    id: DomainId,
}

/// Two-level domain → id hash index.
#[derive(Debug)]
pub struct DomainMphf {
    primary: HashMap<u64, DomainId>,
    collisions: HashMap<u64, Vec<CollisionEntry>>,
    hasher: Hasher,
}

impl DomainMphf {
    /// Artifact path for a version.
    pub fn artifact_path(version: &str) -> String {
        format!("index/{}/domains.mphf", version)
    }

    /// Build the index over a dictionary; `domains[i]` gets id `i`.
    pub fn build(domains: &[String]) -> Self {
        Self::build_with(domains, hash64)
    }

    fn build_with(domains: &[String], hasher: Hasher) -> Self {
        let mut index = Self {
            primary: HashMap::with_capacity(domains.len()),
            collisions: HashMap::new(),
            hasher,
        };

        for (id, domain) in domains.iter().enumerate() {
            let id = id as DomainId;
            let hash = hasher(domain);

            if let Some(entries) = index.collisions.get_mut(&hash) {
                entries.push(CollisionEntry {
                    tag: tag16(hash),
                    domain: domain.clone(),
                    id,
                });
            } else if let Some(&existing_id) = index.primary.get(&hash) {
                // First collision on this hash: evict the primary owner into
                // the collision map. Ids index the build slice, so the owner
                // string is recoverable.
                index.primary.remove(&hash);
                index.collisions.insert(
                    hash,
                    vec![
                        CollisionEntry {
                            tag: tag16(hash),
                            domain: domains[existing_id as usize].clone(),
                            id: existing_id,
                        },
                        CollisionEntry {
                            tag: tag16(hash),
                            domain: domain.clone(),
                            id,
                        },
                    ],
                );
            } else {
                index.primary.insert(hash, id);
            }
        }

        if !index.collisions.is_empty() {
            tracing::info!(
                "Domain hash index built with {} collision hashes over {} domains",
                index.collisions.len(),
                domains.len()
            );
        }

        index
    }

    /// Look up a domain id. Returns `None` for domains outside the build set.
    pub fn lookup(&self, domain: &str) -> Option<DomainId> {
        let hash = (self.hasher)(domain);

        if let Some(entries) = self.collisions.get(&hash) {
            let tag = tag16(hash);
            return entries
                .iter()
                .find(|e| e.tag == tag && e.domain == domain)
                .map(|e| e.id);
        }

        self.primary.get(&hash).copied()
    }

    /// Number of domains covered.
    pub fn len(&self) -> usize {
        self.primary.len() + self.collisions.values().map(|v| v.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize: raw magic, then a compressed body of the two tables in
    /// ascending hash order, all integers little-endian.
    pub fn to_bytes(&self, codec: Codec, level: i32) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        body.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        body.extend_from_slice(&(self.primary.len() as u64).to_le_bytes());
        body.extend_from_slice(&(self.collisions.len() as u32).to_le_bytes());

        let mut primary: Vec<(u64, DomainId)> =
            self.primary.iter().map(|(&h, &id)| (h, id)).collect();
        primary.sort_unstable();
        for (hash, id) in primary {
            body.extend_from_slice(&hash.to_le_bytes());
            body.extend_from_slice(&id.to_le_bytes());
        }

        let mut collision_hashes: Vec<u64> = self.collisions.keys().copied().collect();
        collision_hashes.sort_unstable();
        for hash in collision_hashes {
            let entries = &self.collisions[&hash];
            body.extend_from_slice(&hash.to_le_bytes());
            body.extend_from_slice(&(entries.len() as u16).to_le_bytes());
            for entry in entries {
                body.extend_from_slice(&entry.tag.to_le_bytes());
                body.extend_from_slice(&(entry.domain.len() as u16).to_le_bytes());
                body.extend_from_slice(entry.domain.as_bytes());
                body.extend_from_slice(&entry.id.to_le_bytes());
            }
        }

        let mut out = Vec::with_capacity(4 + body.len() / 2);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&codec.compress(&body, level)?);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8], codec: Codec) -> Result<Self> {
        Self::from_bytes_with(data, codec, hash64)
    }

    fn from_bytes_with(data: &[u8], codec: Codec, hasher: Hasher) -> Result<Self> {
        if data.len() < 4 || &data[..4] != MAGIC {
            return Err(Error::format_invalid("bad magic for domain hash index"));
        }
        let body = codec.decompress(&data[4..])?;
        let mut reader = ByteReader::new(&body);

        let version = reader.read_u32("hash index version")?;
        if version != FORMAT_VERSION {
            return Err(Error::format_invalid(format!(
                "unsupported domain hash index version: {}",
                version
            )));
        }

        let primary_count = reader.read_u64("primary entry count")?;
        let collision_count = reader.read_u32("collision key count")?;

        let mut primary = HashMap::with_capacity(primary_count as usize);
        for _ in 0..primary_count {
            let hash = reader.read_u64("primary hash")?;
            let id = reader.read_u32("primary domain id")?;
            primary.insert(hash, id);
        }

        let mut collisions = HashMap::with_capacity(collision_count as usize);
        for _ in 0..collision_count {
            let hash = reader.read_u64("collision hash")?;
            let n = reader.read_u16("collision entry count")?;
            let mut entries = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let tag = reader.read_u16("collision tag")?;
                let len = reader.read_u16("collision domain length")?;
                let domain = std::str::from_utf8(reader.take(len as usize, "collision domain")?)
                    .map_err(|e| {
                        Error::format_invalid(format!("collision domain not UTF-8: {}", e))
                    })?
                    .to_string();
                let id = reader.read_u32("collision domain id")?;
                entries.push(CollisionEntry { tag, domain, id });
            }
            collisions.insert(hash, entries);
        }

        Ok(Self {
            primary,
            collisions,
            hasher,
        })
    }

    pub async fn save(
        &self,
        storage: &Arc<dyn StorageBackend>,
        version: &str,
        codec: Codec,
        level: i32,
    ) -> Result<String> {
        let path = Self::artifact_path(version);
        let bytes = self.to_bytes(codec, level)?;
        tracing::info!(
            "Writing domain hash index for {} domains to {} ({} bytes)",
            self.len(),
            path,
            bytes.len()
        );
        storage.put(&path, Bytes::from(bytes)).await?;
        Ok(path)
    }

    pub async fn load(
        storage: &Arc<dyn StorageBackend>,
        path: &str,
        codec: Codec,
    ) -> Result<Self> {
        let data = storage.get(path).await?;
        Self::from_bytes(&data, codec)
    }
}
