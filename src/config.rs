//! Engine configuration.
//!
//! Settings come from an optional TOML file and are then overridden by
//! command-line flags.

use crate::{
    enums::{BitDepth, VarianceNormalization},
    series_loader::LoaderOptions,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker threads for accumulation. Unset means one per hardware thread.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Bits per output sample, 8 or 16.
    #[serde(default)]
    pub bit_depth: BitDepth,

    /// Variance denominator used for standard deviation output.
    #[serde(default)]
    pub variance: VarianceNormalization,

    /// Upper bound, in MiB, on the accumulator grids of all workers together.
    #[serde(default)]
    pub max_grid_memory_mb: Option<usize>,

    #[serde(default)]
    pub loader: LoaderOptions,
}

impl EngineConfig {
    /// Memory limit in bytes.
    pub fn max_grid_memory_bytes(&self) -> Option<usize> {
        self.max_grid_memory_mb.map(|mb| mb.saturating_mul(1 << 20))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.bit_depth, BitDepth::Sixteen);
        assert_eq!(config.variance, VarianceNormalization::Population);
        assert_eq!(config.loader.spacing_epsilon, 1e-4);
        assert_eq!(config.max_grid_memory_bytes(), None);
    }

    #[test]
    fn parses_all_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            workers = 3
            bit_depth = 8
            variance = "sample"
            max_grid_memory_mb = 2048

            [loader]
            spacing_epsilon = 0.01
            extensions = ["dcm", "ima"]
            strict = true
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.bit_depth, BitDepth::Eight);
        assert_eq!(config.variance, VarianceNormalization::Sample);
        assert_eq!(config.max_grid_memory_bytes(), Some(2048 << 20));
        assert_eq!(config.loader.extensions, vec!["dcm", "ima"]);
        assert!(config.loader.strict);
    }

    #[test]
    fn rejects_unknown_bit_depth() {
        assert!(EngineConfig::from_toml_str("bit_depth = 12").is_err());
    }
}
