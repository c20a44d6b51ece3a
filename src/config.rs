use std::env;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;

use crate::compress::Codec;

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageSection,
    pub compression: CompressionSection,
    pub postings: PostingsSection,
    pub cache: CacheSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path = env::var("URLDEX_CONFIG").unwrap_or_else(|_| "urldex.toml".to_string());

        let mut builder = config::Config::builder();

        if Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(&config_path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("URLDEX")
                .separator("_")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        config.validate()?;

        Ok(config)
    }

    /// Reject values the index cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.postings.num_shards == 0 {
            anyhow::bail!("postings.num_shards must be at least 1");
        }
        if self.storage.domain_prefix_chars == 0 || self.storage.domain_prefix_chars > 16 {
            anyhow::bail!("storage.domain_prefix_chars must be in 1..=16");
        }
        if self.cache.postings_shards_capacity == 0
            || self.cache.domain_lookup_capacity == 0
            || self.cache.memberships_capacity == 0
        {
            anyhow::bail!("cache capacities must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Root of the data and index trees.
    pub base_path: String,
    /// Hex characters of `hash(domain)` used for partitioning.
    pub domain_prefix_chars: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            base_path: "./data".to_string(),
            domain_prefix_chars: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionSection {
    pub codec: Codec,
    pub level: i32,
}

impl Default for CompressionSection {
    fn default() -> Self {
        Self {
            codec: Codec::Zstd,
            level: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostingsSection {
    pub num_shards: u32,
}

impl Default for PostingsSection {
    fn default() -> Self {
        Self { num_shards: 1024 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub domain_lookup_capacity: usize,
    pub memberships_capacity: usize,
    pub postings_shards_capacity: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            domain_lookup_capacity: 1000,
            memberships_capacity: 1000,
            postings_shards_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = AppConfig::default();
        assert_eq!(config.storage.domain_prefix_chars, 2);
        assert_eq!(config.compression.codec, Codec::Zstd);
        assert_eq!(config.compression.level, 6);
        assert_eq!(config.postings.num_shards, 1024);
        assert_eq!(config.cache.domain_lookup_capacity, 1000);
        assert_eq!(config.cache.memberships_capacity, 1000);
        assert_eq!(config.cache.postings_shards_capacity, 64);
    }

    #[test]
    fn test_validate_rejects_zero_shards() {
        let mut config = AppConfig::default();
        config.postings.num_shards = 0;
        assert!(config.validate().is_err());
    }
}
