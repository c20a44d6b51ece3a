//! Error types for urldex

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid artifact format: {0}")]
    FormatInvalid(String),

    #[error("Version corrupt: {0}")]
    VersionCorrupt(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("Dataset {dataset_id} does not contain domain {domain}")]
    DatasetMismatch { domain: String, dataset_id: u32 },

    #[error("Build conflict: {0}")]
    BuildConflict(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn format_invalid(msg: impl Into<String>) -> Self {
        Error::FormatInvalid(msg.into())
    }

    pub fn version_corrupt(msg: impl Into<String>) -> Self {
        Error::VersionCorrupt(msg.into())
    }

    pub fn config_invalid(msg: impl Into<String>) -> Self {
        Error::ConfigInvalid(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Stable machine-readable code, used by the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Storage(_) => "storage_error",
            Error::FormatInvalid(_) => "format_invalid",
            Error::VersionCorrupt(_) => "version_corrupt",
            Error::DomainNotFound(_) => "domain_not_found",
            Error::DatasetMismatch { .. } => "dataset_mismatch",
            Error::BuildConflict(_) => "build_conflict",
            Error::ConfigInvalid(_) => "config_invalid",
            Error::Serialization(_) => "serialization_error",
            Error::Arrow(_) => "arrow_error",
            Error::Parquet(_) => "parquet_error",
            Error::Io(_) => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }
}
