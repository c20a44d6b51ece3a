//! Query engine
//!
//! Serves the two read operations over one published version: which
//! datasets contain a domain, and the URLs of a `(domain, dataset)` pair,
//! paginated. A query captures the version snapshot at its first lookup and
//! holds it for the whole query; `reload` swaps the snapshot wholesale,
//! which also discards every per-version cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use serde::Serialize;

use crate::config::CacheSection;
use crate::index::dictionary::DomainDictionary;
use crate::index::file_registry::FileRegistry;
use crate::index::membership::MembershipIndex;
use crate::index::mphf::DomainMphf;
use crate::index::postings::PostingsReader;
use crate::index::RecordFileScanner;
use crate::manifest::{ManifestStore, VersionEntry};
use crate::storage::StorageBackend;
use crate::types::{DatasetId, DomainId};
use crate::{Error, Result};

const DEFAULT_NUM_SHARDS: u32 = 1024;

/// One dataset containing a queried domain.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetInfo {
    pub dataset_id: DatasetId,
    /// Exact counts are not maintained; always null for now.
    pub url_count_est: Option<u64>,
}

/// Response of [`QueryEngine::datasets_for_domain`].
#[derive(Debug, Clone, Serialize)]
pub struct DomainResponse {
    pub domain: String,
    pub domain_id: DomainId,
    pub datasets: Vec<DatasetInfo>,
}

/// One materialized URL.
#[derive(Debug, Clone, Serialize)]
pub struct UrlItem {
    pub url_id: i64,
    pub url: String,
}

/// Response of [`QueryEngine::urls_for`].
#[derive(Debug, Clone, Serialize)]
pub struct UrlsResponse {
    pub domain: String,
    pub dataset_id: DatasetId,
    pub items: Vec<UrlItem>,
    pub next_offset: Option<usize>,
}

/// Summary of the loaded version, surfaced by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub version: String,
    pub num_domains: usize,
    pub num_files: usize,
}

/// Immutable in-memory view of one published version, plus its caches.
struct VersionSnapshot {
    entry: VersionEntry,
    num_domains: usize,
    mphf: DomainMphf,
    membership: MembershipIndex,
    registry: FileRegistry,
    postings: PostingsReader,
    domain_ids: Mutex<LruCache<String, Option<DomainId>>>,
    memberships: Mutex<LruCache<DomainId, Arc<Vec<DatasetId>>>>,
}

impl VersionSnapshot {
    async fn load(
        storage: Arc<dyn StorageBackend>,
        entry: VersionEntry,
        num_shards: u32,
        cache: &CacheSection,
    ) -> Result<Self> {
        let version = entry.version.clone();

        let domains = DomainDictionary::load(&storage, &entry.domains_txt, entry.codec)
            .await
            .map_err(|e| corrupt("domain dictionary", &version, e))?;

        let mphf = DomainMphf::load(&storage, &entry.domains_mphf, entry.codec)
            .await
            .map_err(|e| corrupt("domain hash index", &version, e))?;

        let membership = MembershipIndex::load(&storage, &entry.d2d_roar, domains.len())
            .await
            .map_err(|e| corrupt("membership index", &version, e))?;

        let registry = FileRegistry::load(&storage, &entry.files_tsv, entry.codec)
            .await
            .map_err(|e| corrupt("file registry", &version, e))?;

        let postings = PostingsReader::new(
            storage,
            entry.postings_base.clone(),
            entry.codec,
            num_shards,
            cache.postings_shards_capacity,
        );

        tracing::info!(
            "Loaded version {}: {} domains, {} files",
            version,
            domains.len(),
            registry.len()
        );

        Ok(Self {
            entry,
            num_domains: domains.len(),
            mphf,
            membership,
            registry,
            postings,
            domain_ids: Mutex::new(LruCache::new(nonzero(cache.domain_lookup_capacity))),
            memberships: Mutex::new(LruCache::new(nonzero(cache.memberships_capacity))),
        })
    }

    fn domain_id(&self, domain: &str) -> Option<DomainId> {
        if let Some(cached) = self.domain_ids.lock().unwrap().get(domain) {
            return *cached;
        }
        let id = self.mphf.lookup(domain);
        self.domain_ids.lock().unwrap().put(domain.to_string(), id);
        id
    }

    fn datasets(&self, domain_id: DomainId) -> Arc<Vec<DatasetId>> {
        if let Some(cached) = self.memberships.lock().unwrap().get(&domain_id) {
            return cached.clone();
        }
        let datasets = Arc::new(self.membership.datasets_for(domain_id));
        self.memberships
            .lock()
            .unwrap()
            .put(domain_id, datasets.clone());
        datasets
    }
}

fn nonzero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity.max(1)).unwrap()
}

/// Artifacts referenced by the current version must be present and intact.
fn corrupt(artifact: &str, version: &str, error: Error) -> Error {
    match error {
        Error::FormatInvalid(_) => error,
        other => Error::version_corrupt(format!(
            "{} of version {} unavailable: {}",
            artifact, version, other
        )),
    }
}

/// Read-side entry point over a published index.
pub struct QueryEngine {
    storage: Arc<dyn StorageBackend>,
    cache_config: CacheSection,
    snapshot: RwLock<Arc<VersionSnapshot>>,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine").finish_non_exhaustive()
    }
}

impl QueryEngine {
    /// Open the engine on the current version of the manifest.
    pub async fn open(
        storage: Arc<dyn StorageBackend>,
        cache_config: CacheSection,
    ) -> Result<Self> {
        let snapshot = Self::load_current(&storage, &cache_config).await?;
        Ok(Self {
            storage,
            cache_config,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    async fn load_current(
        storage: &Arc<dyn StorageBackend>,
        cache_config: &CacheSection,
    ) -> Result<VersionSnapshot> {
        let manifest = ManifestStore::new(storage.clone()).load().await?;
        let num_shards = manifest.num_shards.unwrap_or(DEFAULT_NUM_SHARDS);
        let entry = manifest
            .current()
            .cloned()
            .ok_or_else(|| Error::internal("manifest has no current version"))?;

        VersionSnapshot::load(storage.clone(), entry, num_shards, cache_config).await
    }

    /// Re-read the manifest; if the current version changed, swap in a fresh
    /// snapshot (invalidating all caches). Returns whether a swap happened.
    pub async fn reload(&self) -> Result<bool> {
        let loaded = Self::load_current(&self.storage, &self.cache_config).await?;

        {
            let current = self.snapshot.read().unwrap();
            if current.entry.version == loaded.entry.version {
                return Ok(false);
            }
        }

        *self.snapshot.write().unwrap() = Arc::new(loaded);
        Ok(true)
    }

    fn snapshot(&self) -> Arc<VersionSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    pub fn stats(&self) -> EngineStats {
        let snapshot = self.snapshot();
        EngineStats {
            version: snapshot.entry.version.clone(),
            num_domains: snapshot.num_domains,
            num_files: snapshot.registry.len(),
        }
    }

    /// Datasets containing `domain`, ascending by dataset id.
    pub async fn datasets_for_domain(&self, domain: &str) -> Result<DomainResponse> {
        let snapshot = self.snapshot();

        let domain_id = snapshot
            .domain_id(domain)
            .ok_or_else(|| Error::DomainNotFound(domain.to_string()))?;

        let datasets = snapshot
            .datasets(domain_id)
            .iter()
            .map(|&dataset_id| DatasetInfo {
                dataset_id,
                url_count_est: None,
            })
            .collect();

        Ok(DomainResponse {
            domain: domain.to_string(),
            domain_id,
            datasets,
        })
    }

    /// URLs of `(domain, dataset_id)`, paginated over the stable locator
    /// order of the postings index.
    pub async fn urls_for(
        &self,
        domain: &str,
        dataset_id: DatasetId,
        offset: usize,
        limit: usize,
    ) -> Result<UrlsResponse> {
        let snapshot = self.snapshot();

        let domain_id = snapshot
            .domain_id(domain)
            .ok_or_else(|| Error::DomainNotFound(domain.to_string()))?;

        if !snapshot.datasets(domain_id).contains(&dataset_id) {
            return Err(Error::DatasetMismatch {
                domain: domain.to_string(),
                dataset_id,
            });
        }

        let locators = snapshot.postings.lookup(domain_id, dataset_id).await?;

        let mut items = Vec::new();
        let mut seen = 0usize;

        'locators: for (file_id, row_group) in locators {
            let Some(info) = snapshot.registry.file_info(file_id) else {
                tracing::warn!("File {} not in registry, skipping locator", file_id);
                continue;
            };

            let key = format!("{}{}", snapshot.entry.parquet_root, info.relative_path);
            let data = match self.storage.get(&key).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Record file {} unreadable, skipping: {}", key, e);
                    continue;
                }
            };

            let rows = match RecordFileScanner::new(data)
                .and_then(|scanner| scanner.url_rows(row_group as usize, domain))
            {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(
                        "Row group {} of {} unreadable, skipping: {}",
                        row_group,
                        key,
                        e
                    );
                    continue;
                }
            };

            for row in rows {
                if seen >= offset && items.len() < limit {
                    items.push(UrlItem {
                        url_id: row.url_id,
                        url: format!("{}://{}{}", row.scheme, row.host, row.path_query),
                    });
                }
                seen += 1;
                if items.len() == limit {
                    break 'locators;
                }
            }
        }

        let next_offset = if !items.is_empty() && items.len() == limit {
            Some(offset + limit)
        } else {
            None
        };

        Ok(UrlsResponse {
            domain: domain.to_string(),
            dataset_id,
            items,
            next_offset,
        })
    }
}
