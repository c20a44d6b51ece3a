//! Domain dictionary
//!
//! The authoritative sorted list of distinct domain strings of one version.
//! A domain's position in the list is its domain id, so the list is
//! append-only across versions: incremental builds keep the previous
//! dictionary as a byte-identical prefix and append only new domains,
//! sorted among themselves.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use bytes::Bytes;

use crate::compress::Codec;
use crate::storage::StorageBackend;
use crate::Result;

/// Builder and reader for the compressed domain dictionary artifact.
pub struct DomainDictionary {
    storage: Arc<dyn StorageBackend>,
    codec: Codec,
    level: i32,
}

impl DomainDictionary {
    pub fn new(storage: Arc<dyn StorageBackend>, codec: Codec, level: i32) -> Self {
        Self {
            storage,
            codec,
            level,
        }
    }

    /// Artifact path for a version.
    pub fn artifact_path(version: &str, codec: Codec) -> String {
        format!("index/{}/domains.txt.{}", version, codec.extension())
    }

    /// Write the dictionary for `version`, returning the artifact path.
    pub async fn write(&self, version: &str, domains: &[String]) -> Result<String> {
        let mut text = String::new();
        for domain in domains {
            text.push_str(domain);
            text.push('\n');
        }

        let compressed = self.codec.compress(text.as_bytes(), self.level)?;

        let path = Self::artifact_path(version, self.codec);
        tracing::info!(
            "Writing {} domains to {} ({} bytes -> {} bytes)",
            domains.len(),
            path,
            text.len(),
            compressed.len()
        );
        self.storage.put(&path, Bytes::from(compressed)).await?;

        Ok(path)
    }

    /// Read a dictionary artifact. An empty decompressed stream and a
    /// stream of only the trailing newline both decode to zero domains.
    pub async fn read(&self, path: &str) -> Result<Vec<String>> {
        Self::load(&self.storage, path, self.codec).await
    }

    /// Read a dictionary artifact written with `codec`.
    pub async fn load(
        storage: &Arc<dyn StorageBackend>,
        path: &str,
        codec: Codec,
    ) -> Result<Vec<String>> {
        let compressed = storage.get(path).await?;
        let text = codec.decompress(&compressed)?;
        let text = String::from_utf8(text)
            .map_err(|e| crate::Error::format_invalid(format!("dictionary not UTF-8: {}", e)))?;

        Ok(text
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect())
    }

    /// Merge for incremental builds: previous domains keep their positions,
    /// unseen domains are appended in ascending order.
    pub fn merge_append(previous: Vec<String>, observed: BTreeSet<String>) -> Vec<String> {
        let known: HashSet<&str> = previous.iter().map(|d| d.as_str()).collect();

        let fresh: Vec<String> = observed
            .into_iter()
            .filter(|d| !known.contains(d.as_str()))
            .collect();

        drop(known);

        let mut merged = previous;
        merged.extend(fresh);
        merged
    }
}
