#![allow(dead_code)]

//! Shared fixtures for the integration suites.

use std::sync::Arc;

use tempfile::TempDir;

use urldex::config::CacheSection;
use urldex::datasets::DatasetRegistry;
use urldex::index::builder::{BuildOptions, IndexBuilder};
use urldex::query::QueryEngine;
use urldex::storage::local::LocalStorage;
use urldex::storage::writer::RecordWriter;
use urldex::types::{DatasetId, UrlRecord};

/// A scratch base path with its storage backend. The TempDir must stay
/// alive for the duration of the test.
pub struct TestBase {
    pub temp: TempDir,
    pub storage: Arc<LocalStorage>,
}

impl TestBase {
    /// The storage backend as the trait object most library APIs take.
    pub fn dyn_storage(&self) -> Arc<dyn urldex::storage::StorageBackend> {
        self.storage.clone()
    }
}

pub fn test_base() -> TestBase {
    let temp = TempDir::new().unwrap();
    let storage = Arc::new(LocalStorage::new(temp.path()).unwrap());
    TestBase { temp, storage }
}

pub fn build_options(num_shards: u32) -> BuildOptions {
    BuildOptions {
        num_shards,
        ..BuildOptions::default()
    }
}

pub fn builder(base: &TestBase, num_shards: u32) -> IndexBuilder {
    IndexBuilder::new(base.storage.clone(), build_options(num_shards))
}

pub async fn engine(base: &TestBase) -> QueryEngine {
    QueryEngine::open(base.storage.clone(), CacheSection::default())
        .await
        .unwrap()
}

pub fn record(
    dataset_id: DatasetId,
    scheme: &str,
    host: &str,
    path_query: &str,
    domain: &str,
) -> UrlRecord {
    UrlRecord::new(dataset_id, scheme, host, path_query, domain, 2)
}

/// Write records through the ingestion seam, with small row groups so a few
/// records already span several row groups.
pub async fn write_records(base: &TestBase, records: &[UrlRecord]) -> Vec<String> {
    RecordWriter::new(base.storage.clone(), 2)
        .with_row_group_rows(2)
        .append(records)
        .await
        .unwrap()
}

pub async fn register_datasets(base: &TestBase, names: &[&str]) -> Vec<DatasetId> {
    let mut registry = DatasetRegistry::load(base.storage.clone()).await.unwrap();
    let mut ids = Vec::with_capacity(names.len());
    for name in names {
        ids.push(registry.register(name).await.unwrap());
    }
    ids
}
