//! Simulator configuration.
//!
//! Loads and saves the workload and cache parameters from TOML files. The
//! cache itself is configured under a `[cache]` table.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use blkcache::CacheConfig;
use blkcache_common::constants::PAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Workload parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Worker threads.
    pub threads: usize,
    /// Operations per worker.
    pub ops: usize,
    /// Storage objects the workers spread over.
    pub objects: u64,
    /// Distinct blocks per object.
    pub blocks: u64,
    /// Size of every block in bytes.
    pub block_size: usize,
    /// Fraction of operations that dirty a block.
    pub write_ratio: f64,
    /// Fraction of writes issued synchronously instead of delayed.
    pub sync_ratio: f64,
    /// Fraction of operations that invalidate a block.
    pub invalidate_ratio: f64,
    /// Seed for the per-worker generators.
    pub seed: u64,
    /// Cache parameters.
    pub cache: CacheConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops: 10_000,
            objects: 2,
            blocks: 4096,
            block_size: PAGE_SIZE,
            write_ratio: 0.3,
            sync_ratio: 0.05,
            invalidate_ratio: 0.01,
            seed: 42,
            cache: CacheConfig::default(),
        }
    }
}

impl SimConfig {
    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks the workload parameters and the cache configuration.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.threads > 0, "threads must be > 0");
        ensure!(self.objects > 0 && self.blocks > 0, "objects and blocks must be > 0");
        ensure!(
            self.block_size > 0 && self.block_size <= self.cache.max_buffer_size,
            "block_size must be in 1..={}",
            self.cache.max_buffer_size
        );
        for (name, ratio) in [
            ("write_ratio", self.write_ratio),
            ("sync_ratio", self.sync_ratio),
            ("invalidate_ratio", self.invalidate_ratio),
        ] {
            ensure!((0.0..=1.0).contains(&ratio), "{name} must be within 0..=1");
        }
        ensure!(
            self.write_ratio + self.invalidate_ratio <= 1.0,
            "write_ratio + invalidate_ratio must not exceed 1"
        );
        self.cache
            .validate()
            .map_err(|e| anyhow::anyhow!("cache: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "threads = 8\nwrite_ratio = 0.5\n\n[cache]\nnbuf = 256\nhi_dirty = 84\nlo_dirty = 42"
        )
        .unwrap();

        let config = SimConfig::from_file(file.path()).unwrap();
        assert_eq!(config.threads, 8);
        assert_eq!(config.write_ratio, 0.5);
        assert_eq!(config.cache.nbuf, 256);
        assert_eq!(config.ops, SimConfig::default().ops);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let config = SimConfig {
            threads: 2,
            cache: CacheConfig::new(64).with_dirty_watermarks(8, 16),
            ..SimConfig::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();
        assert_eq!(SimConfig::from_file(file.path()).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_ratios() {
        let config = SimConfig {
            write_ratio: 0.9,
            invalidate_ratio: 0.2,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
