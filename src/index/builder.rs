//! Index build orchestration
//!
//! Builds one new version of every artifact from the record store, then
//! publishes it through the manifest. Nothing a failed build wrote is ever
//! referenced: the manifest rename is the only commit point, so readers keep
//! the previous version until publish succeeds.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::compress::Codec;
use crate::index::dictionary::DomainDictionary;
use crate::index::file_registry::FileRegistry;
use crate::index::membership::MembershipIndex;
use crate::index::mphf::DomainMphf;
use crate::index::postings::{self, PostingsBuilder};
use crate::index::RecordFileScanner;
use crate::manifest::{Manifest, ManifestStore, VersionEntry};
use crate::storage::layout::{StorageLayout, URLS_ROOT};
use crate::storage::StorageBackend;
use crate::types::RecordFileInfo;
use crate::{Error, Result};

const VERSION_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Build-time knobs, normally taken from the application configuration.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub num_shards: u32,
    pub codec: Codec,
    pub level: i32,
    pub prefix_chars: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            num_shards: 1024,
            codec: Codec::Zstd,
            level: 6,
            prefix_chars: 2,
        }
    }
}

/// Orchestrates full and incremental builds.
pub struct IndexBuilder {
    storage: Arc<dyn StorageBackend>,
    layout: StorageLayout,
    manifest_store: ManifestStore,
    options: BuildOptions,
}

impl IndexBuilder {
    pub fn new(storage: Arc<dyn StorageBackend>, options: BuildOptions) -> Self {
        let layout = StorageLayout::new(storage.clone(), options.prefix_chars);
        let manifest_store = ManifestStore::new(storage.clone());
        Self {
            storage,
            layout,
            manifest_store,
            options,
        }
    }

    /// Build every artifact from scratch and publish a new version.
    pub async fn build_full(&self, version: Option<String>) -> Result<String> {
        let manifest = self.manifest_store.load().await?;
        self.check_config(&manifest)?;
        let expected_current = manifest.current_version.clone();

        let version = version.unwrap_or_else(Self::version_now);
        tracing::info!("Building full index version {}", version);

        let files = self.layout.list_record_files().await?;
        tracing::info!("Found {} record files", files.len());

        // Step 1: domain dictionary
        tracing::info!("Step 1/6: Building domain dictionary...");
        let domains: Vec<String> = self.scan_domains(&files).await?.into_iter().collect();
        let dictionary = self.dictionary();
        dictionary.write(&version, &domains).await?;

        // Step 2: domain hash index over the dictionary
        tracing::info!("Step 2/6: Building domain hash index...");
        let mphf = DomainMphf::build(&domains);
        mphf.save(&self.storage, &version, self.options.codec, self.options.level)
            .await?;

        // Step 3: file registry
        tracing::info!("Step 3/6: Building file registry...");
        let registry = FileRegistry::from_paths(&files);
        registry
            .save(&self.storage, &version, self.options.codec, self.options.level)
            .await?;

        // Steps 4+5: membership and postings from one scan over the files
        tracing::info!("Step 4/6: Building membership index...");
        let mut membership = MembershipIndex::new(domains.len());
        let mut postings = PostingsBuilder::new();
        tracing::info!("Step 5/6: Building postings index...");
        self.scan_memberships_and_postings(
            registry.files(),
            &mphf,
            &mut membership,
            &mut postings,
        )
        .await?;
        membership.save(&self.storage, &version).await?;
        postings
            .save(
                &self.storage,
                &version,
                self.options.codec,
                self.options.level,
                self.options.num_shards,
            )
            .await?;

        // Step 6: publish
        tracing::info!("Step 6/6: Publishing version {}...", version);
        self.publish(&version, expected_current).await?;

        tracing::info!(
            "Built version {}: {} domains, {} files, {} membership pairs, {} posting entries",
            version,
            domains.len(),
            registry.len(),
            membership.pair_count(),
            postings.entry_count()
        );
        Ok(version)
    }

    /// Build a new version on top of the previous one, scanning only record
    /// files the previous version did not register. Returns the previous
    /// version unchanged when there is nothing new.
    pub async fn build_incremental(&self, version: Option<String>) -> Result<String> {
        let manifest = self.manifest_store.load().await?;
        self.check_config(&manifest)?;

        let Some(previous) = manifest.current().cloned() else {
            tracing::info!("No published version yet, falling back to full build");
            return self.build_full(version).await;
        };
        let expected_current = manifest.current_version.clone();

        // New files = on-disk files not in the previous registry
        let files = self.layout.list_record_files().await?;
        let mut registry =
            FileRegistry::load(&self.storage, &previous.files_tsv, previous.codec).await?;
        let new_paths = registry.unknown_paths(&files);

        if new_paths.is_empty() {
            tracing::info!(
                "No new record files since version {}, keeping it",
                previous.version
            );
            return Ok(previous.version);
        }

        let version = version.unwrap_or_else(Self::version_now);
        tracing::info!(
            "Building incremental version {} on top of {} ({} new files)",
            version,
            previous.version,
            new_paths.len()
        );

        // Step 1: dictionary = previous bytes + new domains appended
        tracing::info!("Step 1/6: Extending domain dictionary...");
        let dictionary = self.dictionary();
        let old_domains =
            DomainDictionary::load(&self.storage, &previous.domains_txt, previous.codec).await?;
        let num_old_domains = old_domains.len();
        let observed = self.scan_domains(&new_paths).await?;
        let domains = DomainDictionary::merge_append(old_domains, observed);
        dictionary.write(&version, &domains).await?;

        // Step 2: hash index is rebuilt over the merged dictionary
        tracing::info!("Step 2/6: Rebuilding domain hash index...");
        let mphf = DomainMphf::build(&domains);
        mphf.save(&self.storage, &version, self.options.codec, self.options.level)
            .await?;

        // Step 3: registry keeps prior ids and appends the new files
        tracing::info!("Step 3/6: Extending file registry...");
        let added = registry.append_paths(&new_paths);
        registry
            .save(&self.storage, &version, self.options.codec, self.options.level)
            .await?;

        // Step 4: memberships carried over position-identically, then
        // OR-merged with the new files' contributions
        tracing::info!("Step 4/6: Merging membership index...");
        let mut membership =
            MembershipIndex::load(&self.storage, &previous.d2d_roar, num_old_domains).await?;
        membership.extend_to(domains.len());

        // Step 5: prior postings preserved intact, new files scanned
        tracing::info!("Step 5/6: Merging postings index...");
        let mut postings = PostingsBuilder::new();
        postings
            .load_previous(
                &self.storage,
                &previous.postings_base,
                previous.codec,
                self.options.num_shards,
            )
            .await?;

        self.scan_memberships_and_postings(&added, &mphf, &mut membership, &mut postings)
            .await?;
        membership.save(&self.storage, &version).await?;
        postings
            .save(
                &self.storage,
                &version,
                self.options.codec,
                self.options.level,
                self.options.num_shards,
            )
            .await?;

        // Step 6: publish
        tracing::info!("Step 6/6: Publishing version {}...", version);
        self.publish(&version, expected_current).await?;

        tracing::info!(
            "Built incremental version {}: {} domains ({} new), {} files ({} new)",
            version,
            domains.len(),
            domains.len() - num_old_domains,
            registry.len(),
            added.len()
        );
        Ok(version)
    }

    fn version_now() -> String {
        Utc::now().format(VERSION_FORMAT).to_string()
    }

    fn dictionary(&self) -> DomainDictionary {
        DomainDictionary::new(self.storage.clone(), self.options.codec, self.options.level)
    }

    /// `num_shards` is an invariant of the base path once recorded.
    fn check_config(&self, manifest: &Manifest) -> Result<()> {
        if let Some(recorded) = manifest.num_shards {
            if recorded != self.options.num_shards {
                return Err(Error::config_invalid(format!(
                    "postings.num_shards is {} but the manifest records {}",
                    self.options.num_shards, recorded
                )));
            }
        }
        Ok(())
    }

    /// Distinct domains across `files`. Files that fail to open or parse are
    /// logged and skipped; they never abort a build.
    async fn scan_domains(&self, files: &[String]) -> Result<BTreeSet<String>> {
        let mut domains = BTreeSet::new();

        for (i, relative) in files.iter().enumerate() {
            if (i + 1) % 100 == 0 {
                tracing::info!(
                    "Scanned {}/{} files, {} distinct domains so far",
                    i + 1,
                    files.len(),
                    domains.len()
                );
            }

            match self.open_scanner(relative).await {
                Ok(scanner) => match scanner.distinct_domains() {
                    Ok(found) => domains.extend(found),
                    Err(e) => tracing::warn!("Skipping unreadable record file {}: {}", relative, e),
                },
                Err(e) => tracing::warn!("Skipping unopenable record file {}: {}", relative, e),
            }
        }

        Ok(domains)
    }

    /// One scan per file: per-row-group distinct domains feed both the
    /// membership bitmaps and exact row-group postings.
    async fn scan_memberships_and_postings(
        &self,
        files: &[RecordFileInfo],
        mphf: &DomainMphf,
        membership: &mut MembershipIndex,
        postings: &mut PostingsBuilder,
    ) -> Result<()> {
        for (i, info) in files.iter().enumerate() {
            if (i + 1) % 100 == 0 {
                tracing::info!(
                    "Indexed {}/{} files, {} posting entries so far",
                    i + 1,
                    files.len(),
                    postings.entry_count()
                );
            }

            let scanner = match self.open_scanner(&info.relative_path).await {
                Ok(scanner) => scanner,
                Err(e) => {
                    tracing::warn!(
                        "Skipping unopenable record file {}: {}",
                        info.relative_path,
                        e
                    );
                    continue;
                }
            };

            for row_group in 0..scanner.row_group_count() {
                let found = match scanner.distinct_domains_in_row_group(row_group) {
                    Ok(found) => found,
                    Err(e) => {
                        tracing::warn!(
                            "Skipping row group {} of {}: {}",
                            row_group,
                            info.relative_path,
                            e
                        );
                        continue;
                    }
                };

                for domain in found {
                    let Some(domain_id) = mphf.lookup(&domain) else {
                        // Can only happen when the file changed between the
                        // dictionary scan and this one.
                        tracing::warn!(
                            "Domain '{}' in {} missing from dictionary",
                            domain,
                            info.relative_path
                        );
                        continue;
                    };
                    membership.add(domain_id, info.dataset_id);
                    postings.add(domain_id, info.dataset_id, info.file_id, row_group as u32);
                }
            }
        }

        Ok(())
    }

    async fn open_scanner(&self, relative: &str) -> Result<RecordFileScanner> {
        let data = self.storage.get(&StorageLayout::record_key(relative)).await?;
        RecordFileScanner::new(data)
    }

    fn version_entry(&self, version: &str) -> VersionEntry {
        VersionEntry {
            version: version.to_string(),
            created_at: Utc::now().to_rfc3339(),
            domains_txt: DomainDictionary::artifact_path(version, self.options.codec),
            domains_mphf: DomainMphf::artifact_path(version),
            d2d_roar: MembershipIndex::artifact_path(version),
            postings_base: postings::base_path(version),
            files_tsv: FileRegistry::artifact_path(version, self.options.codec),
            parquet_root: format!("{}/", URLS_ROOT),
            codec: self.options.codec,
        }
    }

    /// Re-reads the manifest and commits the version in a single rewrite.
    /// If another builder published in the meantime the current pointer has
    /// moved, and this build aborts without touching it.
    async fn publish(&self, version: &str, expected_current: Option<String>) -> Result<()> {
        let mut manifest = self.manifest_store.load().await?;

        if manifest.current_version != expected_current {
            return Err(Error::BuildConflict(format!(
                "current version moved from {:?} to {:?} during the build",
                expected_current, manifest.current_version
            )));
        }

        manifest.num_shards.get_or_insert(self.options.num_shards);
        manifest.add_version(self.version_entry(version));
        manifest.set_current(version)?;
        self.manifest_store.save(&manifest).await?;
        Ok(())
    }
}
