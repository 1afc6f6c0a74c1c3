//! Directory configuration
//!
//! Block size and compression must match between the writer and every reader
//! of the same store; everything else is local to the process.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for a single block (one hash field value)
pub const MAX_BLOCK_SIZE: usize = 512 * 1024 * 1024;

pub const ENV_BLOCK_SIZE: &str = "KVDIR_BLOCK_SIZE";
pub const ENV_CATALOG_KEY: &str = "KVDIR_CATALOG_KEY";
pub const ENV_BLOCKS_KEY: &str = "KVDIR_BLOCKS_KEY";
pub const ENV_TIMEOUT_MS: &str = "KVDIR_TIMEOUT_MS";
pub const ENV_LOCK_DIR: &str = "KVDIR_LOCK_DIR";
pub const ENV_COMPRESS: &str = "KVDIR_COMPRESS";
pub const ENV_SYNC_INTERVAL: &str = "KVDIR_SYNC_INTERVAL";
pub const ENV_CHECKSUM: &str = "KVDIR_CHECKSUM";

/// Directory configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Block capacity in bytes
    pub block_size: usize,

    /// Hash key of the name -> length table
    pub catalog_key: String,

    /// Hash key of the block key -> block bytes table
    pub blocks_key: String,

    /// Connection / checkout timeout (milliseconds)
    pub connection_timeout_ms: u64,

    /// Directory holding advisory lock files
    pub lock_dir: PathBuf,

    /// Snappy-compress every block
    pub compress: bool,

    /// Maximum number of pipelined requests between two forced syncs
    pub sync_interval: usize,

    /// Track a running CRC32 in write cursors
    pub checksum: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024, // 64KB
            catalog_key: "directory_metadata".to_string(),
            blocks_key: "file_data".to_string(),
            connection_timeout_ms: 10_000,
            lock_dir: std::env::temp_dir().join("kvdir-locks"),
            compress: false,
            sync_interval: 50,
            checksum: true,
        }
    }
}

impl DirectoryConfig {
    /// Small blocks and a short sync interval so tests cross every boundary
    pub fn for_testing<P: AsRef<Path>>(lock_dir: P) -> Self {
        Self {
            block_size: 1024,
            sync_interval: 4,
            connection_timeout_ms: 1_000,
            lock_dir: lock_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Larger, compressed blocks for big segment files
    pub fn for_large_files() -> Self {
        Self {
            block_size: 1024 * 1024, // 1MB
            compress: true,
            sync_interval: 16,
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields fall back to defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            StorageError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: DirectoryConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `KVDIR_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup (env-style names)
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_BLOCK_SIZE) {
            self.block_size = parse_value(ENV_BLOCK_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_CATALOG_KEY) {
            self.catalog_key = v;
        }
        if let Some(v) = lookup(ENV_BLOCKS_KEY) {
            self.blocks_key = v;
        }
        if let Some(v) = lookup(ENV_TIMEOUT_MS) {
            self.connection_timeout_ms = parse_value(ENV_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_LOCK_DIR) {
            self.lock_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_COMPRESS) {
            self.compress = parse_bool(ENV_COMPRESS, &v)?;
        }
        if let Some(v) = lookup(ENV_SYNC_INTERVAL) {
            self.sync_interval = parse_value(ENV_SYNC_INTERVAL, &v)?;
        }
        if let Some(v) = lookup(ENV_CHECKSUM) {
            self.checksum = parse_bool(ENV_CHECKSUM, &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(StorageError::InvalidConfig("block_size must be > 0".into()));
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(StorageError::InvalidConfig(format!(
                "block_size {} exceeds {}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if self.sync_interval == 0 {
            return Err(StorageError::InvalidConfig("sync_interval must be > 0".into()));
        }
        if self.catalog_key.is_empty() || self.blocks_key.is_empty() {
            return Err(StorageError::InvalidConfig("table keys must not be empty".into()));
        }
        if self.catalog_key == self.blocks_key {
            return Err(StorageError::InvalidConfig(format!(
                "catalog_key and blocks_key must differ (both '{}')",
                self.catalog_key
            )));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Pool settings whose checkout wait is the connection timeout
    pub fn pool_config(&self, max_connections: usize) -> PoolConfig {
        PoolConfig {
            max_connections,
            checkout_timeout_ms: self.connection_timeout_ms,
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live connections
    pub max_connections: usize,

    /// How long a checkout waits for an idle connection (milliseconds)
    pub checkout_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            checkout_timeout_ms: 10_000,
        }
    }
}

impl PoolConfig {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(StorageError::InvalidConfig("max_connections must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| StorageError::InvalidConfig(format!("{}: cannot parse '{}'", key, raw)))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(StorageError::InvalidConfig(format!(
            "{}: expected a boolean, got '{}'",
            key, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = DirectoryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync_interval, 50);
        assert!(!config.compress);
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BLOCK_SIZE, "4096"),
            (ENV_COMPRESS, "true"),
            (ENV_SYNC_INTERVAL, "7"),
            (ENV_LOCK_DIR, "/var/tmp/locks"),
            (ENV_CATALOG_KEY, "meta"),
        ]
        .into_iter()
        .collect();

        let config = DirectoryConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.block_size, 4096);
        assert!(config.compress);
        assert_eq!(config.sync_interval, 7);
        assert_eq!(config.lock_dir, PathBuf::from("/var/tmp/locks"));
        assert_eq!(config.catalog_key, "meta");
        assert_eq!(config.blocks_key, "file_data");
    }

    // the only test touching the process environment
    #[test]
    fn test_from_env() {
        std::env::set_var(ENV_BLOCKS_KEY, "env_file_data");
        std::env::set_var(ENV_TIMEOUT_MS, "2500");
        let config = DirectoryConfig::from_env();
        std::env::remove_var(ENV_BLOCKS_KEY);
        std::env::remove_var(ENV_TIMEOUT_MS);

        let config = config.unwrap();
        assert_eq!(config.blocks_key, "env_file_data");
        assert_eq!(config.connection_timeout(), Duration::from_millis(2500));
        assert_eq!(config.catalog_key, "directory_metadata");
    }

    #[test]
    fn test_bad_override_rejected() {
        let result = DirectoryConfig::default().with_overrides(|k| {
            (k == ENV_BLOCK_SIZE).then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));

        let result = DirectoryConfig::default().with_overrides(|k| {
            (k == ENV_SYNC_INTERVAL).then(|| "0".to_string())
        });
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }

    #[test]
    fn test_same_table_keys_rejected() {
        let config = DirectoryConfig {
            blocks_key: "directory_metadata".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvdir.json");
        std::fs::write(&path, r#"{ "block_size": 2048, "compress": true }"#).unwrap();

        let config = DirectoryConfig::from_json_file(&path).unwrap();
        assert_eq!(config.block_size, 2048);
        assert!(config.compress);
        assert_eq!(config.blocks_key, "file_data");
    }

    #[test]
    fn test_presets() {
        let testing = DirectoryConfig::for_testing("/tmp/x");
        assert_eq!(testing.block_size, 1024);
        assert!(testing.validate().is_ok());

        let large = DirectoryConfig::for_large_files();
        assert!(large.compress);
        assert!(large.validate().is_ok());
    }

    #[test]
    fn test_pool_config_uses_connection_timeout() {
        let config = DirectoryConfig {
            connection_timeout_ms: 250,
            ..Default::default()
        };
        let pool = config.pool_config(4);
        assert_eq!(pool.max_connections, 4);
        assert_eq!(pool.checkout_timeout(), config.connection_timeout());
    }
}
