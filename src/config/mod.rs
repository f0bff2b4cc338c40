//! Configuration
//!
//! TOML file with serde field defaults, validated on load. Every value
//! has a sensible default so a missing config file yields a working
//! instance with a freshly generated device identity.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to serialize TOML: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("config validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub tasks: TaskConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    /// Log filter, overridable with RUST_LOG.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable instance identity (generated on first run).
    #[serde(default = "generate_device_id")]
    pub id: Uuid,

    /// Human-readable name advertised to peers.
    #[serde(default = "default_device_name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Clipboard poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Applications whose copies are never captured.
    #[serde(default)]
    pub excluded_apps: Vec<String>,

    /// Capture whatever is on the clipboard at startup.
    #[serde(default)]
    pub capture_at_launch: bool,

    /// Maximum payload size in bytes.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,

    /// How many recent records participate in content dedup.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for payload files and previews.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Device key file.
    #[serde(default = "default_keys_path")]
    pub keys_path: PathBuf,

    /// Peer registry file.
    #[serde(default = "default_peers_path")]
    pub peers_path: PathBuf,

    /// Hours to keep terminal tasks for inspection.
    #[serde(default = "default_task_retention_hours")]
    pub task_retention_hours: u32,

    /// Days to keep tombstones for offline peers.
    #[serde(default = "default_tombstone_retention_days")]
    pub tombstone_retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Worker pool size; bounds concurrent native handles and file
    /// descriptors.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,

    /// Address the sync server listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Maximum concurrent peer operations.
    #[serde(default = "default_fanout_limit")]
    pub fanout_limit: usize,

    /// Peers reachable without mDNS.
    #[serde(default)]
    pub static_peers: Vec<StaticPeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticPeerConfig {
    pub device_id: Uuid,
    pub name: String,
    pub endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            capture: CaptureConfig::default(),
            storage: StorageConfig::default(),
            tasks: TaskConfig::default(),
            sync: SyncConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: generate_device_id(),
            name: default_device_name(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            excluded_apps: Vec::new(),
            capture_at_launch: false,
            max_payload_size: default_max_payload_size(),
            dedup_window: default_dedup_window(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: default_db_path(),
            keys_path: default_keys_path(),
            peers_path: default_peers_path(),
            task_retention_hours: default_task_retention_hours(),
            tombstone_retention_days: default_tombstone_retention_days(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            listen_addr: default_listen_addr(),
            fanout_limit: default_fanout_limit(),
            static_peers: Vec::new(),
        }
    }
}

impl Config {
    /// Default config file location for this platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pastebeam")
            .join("config.toml")
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to (and persisting) defaults when
    /// the file does not exist yet.
    pub async fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path).await;
        }
        let config = Config::default();
        config.save(path).await?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.poll_interval_ms < 50 {
            return Err(ConfigError::Validation(
                "capture.poll_interval_ms must be at least 50".into(),
            ));
        }
        if self.capture.dedup_window == 0 {
            return Err(ConfigError::Validation(
                "capture.dedup_window must be at least 1".into(),
            ));
        }
        if self.capture.max_payload_size == 0 {
            return Err(ConfigError::Validation(
                "capture.max_payload_size must be positive".into(),
            ));
        }
        if self.tasks.pool_size == 0 {
            return Err(ConfigError::Validation(
                "tasks.pool_size must be at least 1".into(),
            ));
        }
        if self.sync.fanout_limit == 0 {
            return Err(ConfigError::Validation(
                "sync.fanout_limit must be at least 1".into(),
            ));
        }
        if !self.sync.listen_addr.contains(':') {
            return Err(ConfigError::Validation(format!(
                "sync.listen_addr must be host:port, got {}",
                self.sync.listen_addr
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.capture.poll_interval_ms)
    }

    pub fn task_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.storage.task_retention_hours as i64)
    }

    pub fn tombstone_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.storage.tombstone_retention_days as i64)
    }
}

fn generate_device_id() -> Uuid {
    Uuid::new_v4()
}

fn default_device_name() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_max_payload_size() -> usize {
    16 * 1024 * 1024
}

fn default_dedup_window() -> usize {
    50
}

fn app_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pastebeam")
}

fn default_data_dir() -> PathBuf {
    app_data_root().join("payloads")
}

fn default_db_path() -> PathBuf {
    app_data_root().join("pastebeam.db")
}

fn default_keys_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pastebeam")
        .join("device_keys.json")
}

fn default_peers_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pastebeam")
        .join("peers.json")
}

fn default_task_retention_hours() -> u32 {
    24
}

fn default_tombstone_retention_days() -> u32 {
    7
}

fn default_pool_size() -> usize {
    4
}

fn default_sync_enabled() -> bool {
    true
}

fn default_listen_addr() -> String {
    "0.0.0.0:9410".to_string()
}

fn default_fanout_limit() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.poll_interval_ms, 200);
        assert_eq!(config.tasks.pool_size, 4);
        assert!(config.sync.enabled);
    }

    #[test]
    fn minimal_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [capture]
            excluded_apps = ["KeePassXC", "1Password"]
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.excluded_apps.len(), 2);
        assert_eq!(config.capture.dedup_window, 50);
        assert_eq!(config.sync.listen_addr, "0.0.0.0:9410");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.capture.poll_interval_ms = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tasks.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.listen_addr = "no-port".into();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn save_and_reload_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");

        let mut config = Config::default();
        config.capture.capture_at_launch = true;
        config.save(&path).await.unwrap();

        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded.device.id, config.device.id);
        assert!(loaded.capture.capture_at_launch);
    }

    #[tokio::test]
    async fn load_or_init_creates_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");
        let config = Config::load_or_init(&path).await.unwrap();
        assert!(path.exists());

        let again = Config::load_or_init(&path).await.unwrap();
        // Device identity is stable across loads.
        assert_eq!(again.device.id, config.device.id);
    }
}
