//! Index construction and on-disk index artifacts
//!
//! The index over the record store is a set of per-version artifacts: the
//! domain dictionary, the domain hash index, the membership bitmaps, the
//! file registry and the sharded postings. This module also hosts the shared
//! record-file scanner used both at build time and at query time.

use std::collections::BTreeSet;

use arrow::array::{Array, Int64Array, StringArray};
use bytes::Bytes;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ProjectionMask;

use crate::{Error, Result};

pub mod builder;
pub mod dictionary;
pub mod file_registry;
pub mod membership;
pub mod mphf;
pub mod postings;

pub use builder::IndexBuilder;
pub use dictionary::DomainDictionary;
pub use file_registry::FileRegistry;
pub use membership::MembershipIndex;
pub use mphf::DomainMphf;

/// One materialized URL row, projected from a record file.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlRow {
    pub url_id: i64,
    pub scheme: String,
    pub host: String,
    pub path_query: String,
}

/// Row-group-granular reader over one record file held in memory.
pub struct RecordFileScanner {
    data: Bytes,
    num_row_groups: usize,
}

impl RecordFileScanner {
    pub fn new(data: Bytes) -> Result<Self> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(data.clone())?;
        let num_row_groups = builder.metadata().num_row_groups();
        Ok(Self {
            data,
            num_row_groups,
        })
    }

    pub fn row_group_count(&self) -> usize {
        self.num_row_groups
    }

    fn projected_reader(
        &self,
        columns: &[&str],
        row_group: Option<usize>,
    ) -> Result<ParquetRecordBatchReader> {
        let mut builder = ParquetRecordBatchReaderBuilder::try_new(self.data.clone())?;

        let schema = builder.schema().clone();
        let mut indices = Vec::with_capacity(columns.len());
        for column in columns {
            indices.push(schema.index_of(column)?);
        }
        let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
        builder = builder.with_projection(mask);

        if let Some(rg) = row_group {
            builder = builder.with_row_groups(vec![rg]);
        }

        Ok(builder.build()?)
    }

    /// Distinct values of the `domain` column across the whole file.
    pub fn distinct_domains(&self) -> Result<BTreeSet<String>> {
        self.collect_domains(None)
    }

    /// Distinct values of the `domain` column within one row group.
    pub fn distinct_domains_in_row_group(&self, row_group: usize) -> Result<BTreeSet<String>> {
        self.collect_domains(Some(row_group))
    }

    fn collect_domains(&self, row_group: Option<usize>) -> Result<BTreeSet<String>> {
        let reader = self.projected_reader(&["domain"], row_group)?;

        let mut domains = BTreeSet::new();
        for batch in reader {
            let batch = batch?;
            let column = downcast_string(&batch, "domain")?;
            for i in 0..column.len() {
                if !domains.contains(column.value(i)) {
                    domains.insert(column.value(i).to_string());
                }
            }
        }

        Ok(domains)
    }

    /// Materialize the URL rows of one row group whose `domain` column
    /// equals `domain`, in row order.
    pub fn url_rows(&self, row_group: usize, domain: &str) -> Result<Vec<UrlRow>> {
        let reader = self.projected_reader(
            &["url_id", "scheme", "host", "path_query", "domain"],
            Some(row_group),
        )?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;

            let url_ids = downcast_i64(&batch, "url_id")?;
            let schemes = downcast_string(&batch, "scheme")?;
            let hosts = downcast_string(&batch, "host")?;
            let path_queries = downcast_string(&batch, "path_query")?;
            let domains = downcast_string(&batch, "domain")?;

            for i in 0..batch.num_rows() {
                if domains.value(i) == domain {
                    rows.push(UrlRow {
                        url_id: url_ids.value(i),
                        scheme: schemes.value(i).to_string(),
                        host: hosts.value(i).to_string(),
                        path_query: path_queries.value(i).to_string(),
                    });
                }
            }
        }

        Ok(rows)
    }
}

fn downcast_string<'a>(
    batch: &'a arrow::array::RecordBatch,
    name: &str,
) -> Result<&'a StringArray> {
    let index = batch.schema().index_of(name)?;
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| Error::format_invalid(format!("column {} is not Utf8", name)))
}

fn downcast_i64<'a>(batch: &'a arrow::array::RecordBatch, name: &str) -> Result<&'a Int64Array> {
    let index = batch.schema().index_of(name)?;
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| Error::format_invalid(format!("column {} is not Int64", name)))
}

/// Bounds-checked little-endian cursor over artifact bytes.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::format_invalid(format!("truncated while reading {}", what)))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn expect_magic(&mut self, magic: &[u8; 4], what: &str) -> Result<()> {
        let found = self.take(4, what)?;
        if found != magic {
            return Err(Error::format_invalid(format!(
                "bad magic for {}: expected {:?}, found {:?}",
                what, magic, found
            )));
        }
        Ok(())
    }

    pub fn read_u16(&mut self, what: &str) -> Result<u16> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self, what: &str) -> Result<u32> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self, what: &str) -> Result<u64> {
        let bytes = self.take(8, what)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }
}
