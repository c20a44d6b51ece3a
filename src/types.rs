//! Core types for urldex

use serde::{Deserialize, Serialize};

/// Dataset identifier assigned by the dataset registry.
pub type DatasetId = u32;

/// Position of a domain in the sorted domain universe of a version.
pub type DomainId = u32;

/// Stable identifier of a record file in the file registry.
pub type FileId = u32;

/// 64-bit hash used for domain lookup, record-local ids and partitioning.
pub fn hash64(s: &str) -> u64 {
    seahash::hash(s.as_bytes())
}

/// Partition prefix for a domain: the first `prefix_chars` hex characters
/// of its 64-bit hash, lowercase.
pub fn domain_prefix(domain: &str, prefix_chars: usize) -> String {
    let hex = format!("{:016x}", hash64(domain));
    hex[..prefix_chars.min(16)].to_string()
}

/// A single URL observation within one dataset, matching the record-file
/// column schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UrlRecord {
    pub dataset_id: DatasetId,
    /// Record-local hash-form domain id; not comparable to dictionary ids.
    pub domain_id: i64,
    /// Stable hash of the reconstructed URL.
    pub url_id: i64,
    pub scheme: String,
    pub host: String,
    pub path_query: String,
    /// Normalized eTLD+1 string.
    pub domain: String,
    pub domain_prefix: String,
}

impl UrlRecord {
    /// Build a record from already-normalized URL components.
    pub fn new(
        dataset_id: DatasetId,
        scheme: impl Into<String>,
        host: impl Into<String>,
        path_query: impl Into<String>,
        domain: impl Into<String>,
        prefix_chars: usize,
    ) -> Self {
        let scheme = scheme.into();
        let host = host.into();
        let path_query = path_query.into();
        let domain = domain.into();
        let url = format!("{}://{}{}", scheme, host, path_query);
        Self {
            dataset_id,
            domain_id: hash64(&domain) as i64,
            url_id: hash64(&url) as i64,
            domain_prefix: domain_prefix(&domain, prefix_chars),
            scheme,
            host,
            path_query,
            domain,
        }
    }

    /// Reconstruct the URL as stored.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path_query)
    }
}

/// One row of the file registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordFileInfo {
    pub file_id: FileId,
    pub dataset_id: DatasetId,
    pub domain_prefix: String,
    /// Path relative to the record-file root (`urls/`).
    pub relative_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_prefix_shape() {
        let prefix = domain_prefix("example.com", 2);
        assert_eq!(prefix.len(), 2);
        assert!(prefix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // Deterministic for the same domain
        assert_eq!(prefix, domain_prefix("example.com", 2));
    }

    #[test]
    fn test_url_roundtrip() {
        let record = UrlRecord::new(3, "https", "shop.example.com", "/p?q=1", "example.com", 2);
        assert_eq!(record.url(), "https://shop.example.com/p?q=1");
        assert_eq!(record.dataset_id, 3);
        assert_eq!(record.domain_id, hash64("example.com") as i64);
    }
}
