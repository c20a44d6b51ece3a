//! Record-file writer
//!
//! Appends immutable Parquet record files to the partitioned store. Callers
//! supply normalized records (the `domain` column already carries the
//! eTLD+1 string); the writer only groups them by partition and encodes the
//! column schema the index expects.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Builder, RecordBatch, StringBuilder, UInt32Builder};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::storage::layout::StorageLayout;
use crate::storage::StorageBackend;
use crate::types::{DatasetId, UrlRecord};
use crate::Result;

const DEFAULT_ROW_GROUP_ROWS: usize = 1024 * 1024;

/// Writer for partitioned record files.
pub struct RecordWriter {
    storage: Arc<dyn StorageBackend>,
    layout: StorageLayout,
    row_group_rows: usize,
}

impl RecordWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, prefix_chars: usize) -> Self {
        let layout = StorageLayout::new(storage.clone(), prefix_chars);
        Self {
            storage,
            layout,
            row_group_rows: DEFAULT_ROW_GROUP_ROWS,
        }
    }

    /// Override the maximum rows per row group. Small values produce
    /// multi-row-group files from few records.
    pub fn with_row_group_rows(mut self, rows: usize) -> Self {
        self.row_group_rows = rows.max(1);
        self
    }

    /// Arrow schema of a record file.
    pub fn arrow_schema() -> Arc<ArrowSchema> {
        Arc::new(ArrowSchema::new(vec![
            Field::new("dataset_id", DataType::UInt32, false),
            Field::new("domain_id", DataType::Int64, false),
            Field::new("url_id", DataType::Int64, false),
            Field::new("scheme", DataType::Utf8, false),
            Field::new("host", DataType::Utf8, false),
            Field::new("path_query", DataType::Utf8, false),
            Field::new("domain", DataType::Utf8, false),
            Field::new("domain_prefix", DataType::Utf8, false),
        ]))
    }

    /// Append records to the store, one new part file per touched partition.
    ///
    /// Returns the registry-relative paths of the files written, in
    /// partition order.
    pub async fn append(&self, records: &[UrlRecord]) -> Result<Vec<String>> {
        let mut partitions: BTreeMap<(DatasetId, String), Vec<&UrlRecord>> = BTreeMap::new();
        for record in records {
            partitions
                .entry((record.dataset_id, record.domain_prefix.clone()))
                .or_default()
                .push(record);
        }

        let mut written = Vec::with_capacity(partitions.len());
        for ((dataset_id, prefix), group) in partitions {
            let part_number = self.layout.next_part_number(dataset_id, &prefix).await?;
            let relative = StorageLayout::relative_record_path(dataset_id, &prefix, part_number);

            let data = self.encode_parquet(&group)?;
            self.storage
                .put(&StorageLayout::record_key(&relative), data)
                .await?;

            tracing::debug!(
                "Wrote {} records to {} (dataset {}, prefix {})",
                group.len(),
                relative,
                dataset_id,
                prefix
            );
            written.push(relative);
        }

        Ok(written)
    }

    /// Encode records as Parquet bytes.
    fn encode_parquet(&self, records: &[&UrlRecord]) -> Result<Bytes> {
        let batch = self.records_to_batch(records)?;

        let props = WriterProperties::builder()
            .set_compression(parquet::basic::Compression::SNAPPY)
            .set_max_row_group_size(self.row_group_rows)
            .build();

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, Self::arrow_schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;

        Ok(Bytes::from(buffer))
    }

    fn records_to_batch(&self, records: &[&UrlRecord]) -> Result<RecordBatch> {
        let num_rows = records.len();

        let mut dataset_ids = UInt32Builder::with_capacity(num_rows);
        let mut domain_ids = Int64Builder::with_capacity(num_rows);
        let mut url_ids = Int64Builder::with_capacity(num_rows);
        let mut schemes = StringBuilder::new();
        let mut hosts = StringBuilder::new();
        let mut path_queries = StringBuilder::new();
        let mut domains = StringBuilder::new();
        let mut prefixes = StringBuilder::new();

        for record in records {
            dataset_ids.append_value(record.dataset_id);
            domain_ids.append_value(record.domain_id);
            url_ids.append_value(record.url_id);
            schemes.append_value(&record.scheme);
            hosts.append_value(&record.host);
            path_queries.append_value(&record.path_query);
            domains.append_value(&record.domain);
            prefixes.append_value(&record.domain_prefix);
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(dataset_ids.finish()),
            Arc::new(domain_ids.finish()),
            Arc::new(url_ids.finish()),
            Arc::new(schemes.finish()),
            Arc::new(hosts.finish()),
            Arc::new(path_queries.finish()),
            Arc::new(domains.finish()),
            Arc::new(prefixes.finish()),
        ];

        Ok(RecordBatch::try_new(Self::arrow_schema(), columns)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::RecordFileScanner;
    use crate::storage::local::LocalStorage;
    use tempfile::TempDir;

    fn sample_records(dataset_id: DatasetId) -> Vec<UrlRecord> {
        vec![
            UrlRecord::new(dataset_id, "https", "shop.example.com", "/p", "example.com", 2),
            UrlRecord::new(dataset_id, "https", "blog.example.com", "/q", "example.com", 2),
            UrlRecord::new(dataset_id, "https", "example.org", "/r", "example.org", 2),
        ]
    }

    #[tokio::test]
    async fn test_append_partitions_by_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let writer = RecordWriter::new(storage.clone(), 2);

        let written = writer.append(&sample_records(7)).await.unwrap();

        // example.com and example.org hash to different prefixes, so each
        // partition received its own part file.
        let layout = StorageLayout::new(storage.clone(), 2);
        let listed = layout.list_record_files().await.unwrap();
        assert_eq!(listed.len(), written.len());
        for relative in &written {
            assert!(listed.contains(relative));
            assert!(layout.parse_relative_path(relative).is_some());
        }
    }

    #[tokio::test]
    async fn test_row_group_rows_split() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let writer = RecordWriter::new(storage.clone(), 2).with_row_group_rows(2);

        let records: Vec<UrlRecord> = (0..5)
            .map(|i| {
                UrlRecord::new(1, "https", "www.example.com", format!("/{}", i), "example.com", 2)
            })
            .collect();
        let written = writer.append(&records).await.unwrap();
        assert_eq!(written.len(), 1);

        let data = storage
            .get(&StorageLayout::record_key(&written[0]))
            .await
            .unwrap();
        let scanner = RecordFileScanner::new(data).unwrap();
        assert_eq!(scanner.row_group_count(), 3);
    }

    #[tokio::test]
    async fn test_second_append_gets_next_part() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalStorage::new(temp_dir.path()).unwrap());
        let writer = RecordWriter::new(storage.clone(), 2);

        let records =
            vec![UrlRecord::new(4, "http", "example.net", "/", "example.net", 2)];
        let first = writer.append(&records).await.unwrap();
        let second = writer.append(&records).await.unwrap();

        assert!(first[0].ends_with("part-00000.parquet"));
        assert!(second[0].ends_with("part-00001.parquet"));
    }
}
