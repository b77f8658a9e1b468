//! Client configuration, layered: defaults → TOML file → `HUDDLE_` env vars.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::model::ClientId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found at path: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

/// Root configuration of a sync client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub sync: SyncSettings,

    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token sent with every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// Skip the SQLite file entirely (remote-only durability).
    #[serde(default)]
    pub in_memory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Stable identity for self-echo suppression. Random per process if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:54321".to_string()
}
fn default_cache_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("huddle-sync")
        .join("cache.sqlite3")
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            cache: CacheConfig::default(),
            sync: SyncSettings::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            access_token: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            in_memory: false,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            client_id: None,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.poll_interval_secs)
    }

    pub fn client_id(&self) -> ClientId {
        self.sync
            .client_id
            .as_deref()
            .map_or_else(ClientId::random, ClientId::from)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "remote.base_url must not be empty".to_string(),
            ));
        }
        if self.sync.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sync.poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loader with layered merging.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// 1. defaults, 2. config file if set, 3. `HUDDLE_*` env vars
    /// (`__` separates nested keys, e.g. `HUDDLE_SYNC__POLL_INTERVAL_SECS=5`).
    pub fn load(&self) -> Result<SyncConfig> {
        let defaults_json = serde_json::to_string(&SyncConfig::default())?;
        let mut builder = Config::builder().add_source(File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix("HUDDLE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: SyncConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// `./huddle-sync.toml`, then `$XDG_CONFIG_HOME/huddle-sync/config.toml`.
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./huddle-sync.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }
        dirs::config_dir()
            .map(|dir| dir.join("huddle-sync").join("config.toml"))
            .filter(|path| path.exists())
    }

    pub fn load_default() -> Result<SyncConfig> {
        match Self::find_config_file() {
            Some(path) => ConfigLoader::new().with_file(path).load(),
            None => ConfigLoader::new().load(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::env;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.remote.base_url, "http://127.0.0.1:54321");
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.log_filter, "info");
        assert!(config.cache.path.ends_with("huddle-sync/cache.sqlite3"));
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn toml_file_overrides_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("huddle-sync.toml");
        std::fs::write(
            &path,
            r#"
log_filter = "debug"

[remote]
base_url = "https://api.example.test"
access_token = "secret"

[sync]
poll_interval_secs = 5
client_id = "desk-1"
"#,
        )
        .expect("write config");

        let config = ConfigLoader::new().with_file(&path).load().expect("load");

        assert_eq!(config.remote.base_url, "https://api.example.test");
        assert_eq!(config.remote.access_token.as_deref(), Some("secret"));
        assert_eq!(config.sync.poll_interval_secs, 5);
        assert_eq!(config.client_id(), ClientId::new("desk-1"));
        assert_eq!(config.log_filter, "debug");
        assert!(!config.cache.in_memory);
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("huddle-sync.toml");
        std::fs::write(
            &path,
            r#"
log_filter = "debug"

[sync]
poll_interval_secs = 30

[cache]
in_memory = false
"#,
        )
        .expect("write config");
        unsafe {
            env::set_var("HUDDLE_SYNC__POLL_INTERVAL_SECS", "7");
            env::set_var("HUDDLE_CACHE__IN_MEMORY", "true");
        }

        let config = ConfigLoader::new().with_file(&path).load();

        unsafe {
            env::remove_var("HUDDLE_SYNC__POLL_INTERVAL_SECS");
            env::remove_var("HUDDLE_CACHE__IN_MEMORY");
        }
        let config = config.expect("load");
        assert_eq!(config.sync.poll_interval_secs, 7);
        assert!(config.cache.in_memory);
        assert_eq!(config.log_filter, "debug");
    }

    #[test]
    #[serial]
    fn zero_poll_interval_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("bad.toml");
        std::fs::write(&path, "[sync]\npoll_interval_secs = 0\n").expect("write config");

        let err = ConfigLoader::new().with_file(&path).load().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = ConfigLoader::new()
            .with_file("/definitely/not/here.toml")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
