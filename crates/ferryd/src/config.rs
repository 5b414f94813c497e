//! TOML configuration for the ferry daemon.

use std::path::{Path, PathBuf};

use ferry_store::DEFAULT_CHUNK_SIZE;
use ferry_sync::FileSyncConfig;
use ferry_types::config::{BatcherConfig, SyncConfig, UsageConfig};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Local paths and identity.
    pub node: NodeSection,
    /// Worker pools, retries and timeouts.
    pub sync: SyncConfig,
    /// Block batching.
    pub batcher: BatcherConfig,
    /// Usage polling.
    pub usage: UsageConfig,
    /// The in-memory remote node.
    pub remote: RemoteSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory holding the metadata database.
    pub data_dir: PathBuf,
    /// Space that files given on the command line are added to.
    pub space_id: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("ferry"))
            .unwrap_or_else(|| PathBuf::from(".ferry"));
        Self {
            data_dir,
            space_id: "personal".to_string(),
        }
    }
}

/// `[remote]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    /// Account byte limit of the node.
    pub limit_bytes: u64,
    /// Chunk size used when importing files.
    pub chunk_size: usize,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            limit_bytes: 1 << 30,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"ferry_sync=debug"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Engine configuration assembled from the sections.
    pub fn file_sync(&self) -> FileSyncConfig {
        FileSyncConfig {
            sync: self.sync.clone(),
            batcher: self.batcher.clone(),
            usage: self.usage.clone(),
        }
    }

    pub fn meta_path(&self) -> PathBuf {
        self.node.data_dir.join("meta")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [node]
            data_dir = "/var/lib/ferry"
            space_id = "team"

            [sync]
            upload_workers = 4
            deletion_workers = 2
            pushers = 3
            retry_delay_ms = 1000
            upload_timeout_ms = 2000
            batch_timeout_ms = 3000

            [batcher]
            max_batch_size = 65536
            max_batch_wait_ms = 50
            min_mixed_fill = 1024
            channel_capacity = 4

            [usage]
            active_interval_ms = 500
            idle_interval_ms = 5000
            default_limit = 1048576

            [remote]
            limit_bytes = 10485760
            chunk_size = 4096

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/ferry"));
        assert_eq!(config.node.space_id, "team");
        assert_eq!(config.sync.upload_workers, 4);
        assert_eq!(config.sync.retry_delay_ms, 1000);
        assert_eq!(config.batcher.max_batch_size, 65536);
        assert_eq!(config.batcher.min_mixed_fill, 1024);
        assert_eq!(config.usage.idle_interval_ms, 5000);
        assert_eq!(config.remote.limit_bytes, 10 * 1024 * 1024);
        assert_eq!(config.remote.chunk_size, 4096);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.meta_path(), PathBuf::from("/var/lib/ferry/meta"));
    }

    #[test]
    fn test_parse_partial_config() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [sync]
            upload_workers = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.upload_workers, 1);
        assert_eq!(config.sync.pushers, SyncConfig::default().pushers);
        assert_eq!(config.batcher, BatcherConfig::default());
        assert_eq!(config.node.space_id, "personal");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_file_sync_config_matches_sections() {
        let config = DaemonConfig::default();
        assert_eq!(config.file_sync(), FileSyncConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(&path, "[remote]\nlimit_bytes = 42\n").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.remote.limit_bytes, 42);
        assert!(DaemonConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
