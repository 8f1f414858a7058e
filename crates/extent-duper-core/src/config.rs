use crate::error::{Error, Result};
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

const MIN_BLOCK_SIZE: u64 = 512;
const MAX_BLOCK_SIZE: u64 = 1024 * 1024;
const MAX_RETRY_LIMIT: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DedupeConfig {
    /// Fingerprint granularity in bytes; also the alignment of every range handed to the primitive.
    pub block_size: u64,
    pub workers: usize,
    /// Resubmissions allowed after the first attempt of a range.
    pub retry_limit: u32,
    /// Size of each read buffer used by byte-exact verification.
    pub max_compare_bytes: usize,
    pub open_writable: bool,
    pub cache_path: Option<PathBuf>,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            retry_limit: 3,
            max_compare_bytes: 1024 * 1024,
            open_writable: false,
            cache_path: None,
        }
    }
}

impl DedupeConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(Error::invalid_config(
                "block_size",
                format!(
                    "must be a power of two between {} and {} (got {})",
                    MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, self.block_size
                ),
            ));
        }

        if self.workers == 0 {
            return Err(Error::invalid_config("workers", "must be at least 1"));
        }

        if self.retry_limit > MAX_RETRY_LIMIT {
            return Err(Error::invalid_config(
                "retry_limit",
                format!("must not exceed {} (got {})", MAX_RETRY_LIMIT, self.retry_limit),
            ));
        }

        if (self.max_compare_bytes as u64) < self.block_size {
            return Err(Error::invalid_config(
                "max_compare_bytes",
                format!(
                    "must be at least the block size {} (got {})",
                    self.block_size, self.max_compare_bytes
                ),
            ));
        }

        Ok(())
    }
}

/// Layer `ExtentDuper.toml` (optional) and `EXTENT_DUPER_*` environment variables over the defaults.
pub fn load_configuration() -> std::result::Result<DedupeConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("ExtentDuper").required(false))
        .add_source(Environment::with_prefix("EXTENT_DUPER").try_parsing(true))
        .build()?;
    builder.try_deserialize::<DedupeConfig>()
}

/// Canonicalize paths and drop repeats so a file is never paired with itself.
/// Paths that cannot be resolved are kept verbatim; opening them later reports the error per file.
pub fn unique_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut result: Vec<PathBuf> = Vec::new();

    for path in paths {
        let resolved = fs::canonicalize(&path).unwrap_or(path);
        if seen.insert(resolved.clone()) {
            result.push(resolved);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = DedupeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.retry_limit, 3);
    }

    #[test]
    fn test_rejects_non_power_of_two_block_size() {
        let config = DedupeConfig {
            block_size: 3000,
            ..DedupeConfig::default()
        };
        match config.validate() {
            Err(Error::InvalidConfig { field, .. }) => assert_eq!(field, "block_size"),
            other => panic!("Expected block_size error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_workers_and_small_compare_buffer() {
        let config = DedupeConfig {
            workers: 0,
            ..DedupeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { ref field, .. }) if field == "workers"
        ));

        let config = DedupeConfig {
            max_compare_bytes: 1024,
            ..DedupeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { ref field, .. }) if field == "max_compare_bytes"
        ));
    }

    #[test]
    fn test_unique_paths_collapses_aliases() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("a.bin");
        fs::write(&file, b"data").unwrap();
        let alias = tmp.path().join(".").join("a.bin");
        let missing = tmp.path().join("missing.bin");

        let result = unique_paths(vec![file.clone(), alias, missing.clone()]);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], fs::canonicalize(&file).unwrap());
        assert_eq!(result[1], missing);
    }
}
