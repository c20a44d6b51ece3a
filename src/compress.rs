//! General-purpose compression for index artifacts
//!
//! Artifacts are written with one configured codec per version; the codec is
//! recorded in the manifest so readers decode with the codec the artifacts
//! were written with.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Supported artifact codecs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Zstd,
    Gzip,
}

impl Codec {
    /// File-name extension for artifacts written with this codec.
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::Zstd => "zst",
            Codec::Gzip => "gz",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "zstd" => Ok(Codec::Zstd),
            "gzip" => Ok(Codec::Gzip),
            other => Err(Error::config_invalid(format!(
                "unsupported compression codec: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Zstd => "zstd",
            Codec::Gzip => "gzip",
        }
    }

    pub fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            Codec::Zstd => Ok(zstd::encode_all(data, level)?),
            Codec::Gzip => {
                let gz_level = flate2::Compression::new(level.clamp(0, 9) as u32);
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), gz_level);
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Zstd => zstd::decode_all(data)
                .map_err(|e| Error::format_invalid(format!("zstd decode failed: {}", e))),
            Codec::Gzip => {
                let mut decoder = flate2::read::GzDecoder::new(data);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| Error::format_invalid(format!("gzip decode failed: {}", e)))?;
                Ok(out)
            }
        }
    }
}
