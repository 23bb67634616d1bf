//! Configuration for tally-store

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally-store")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// SQLite file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Seconds between reconciliation passes
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Seconds to wait after a failed pass before retrying
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// How long `stop()` waits for an in-flight pass
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Upper bound on a single collection fetch
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Consecutive failed passes before the outage is reported as an error
    #[serde(default = "default_outage_alert_threshold")]
    pub outage_alert_threshold: u32,

    /// Minimum zero-padded width of allocated identifier suffixes
    #[serde(default = "default_id_suffix_width")]
    pub id_suffix_width: usize,

    /// Attempts before an allocation gives up on a busy database
    #[serde(default = "default_allocation_retries")]
    pub allocation_retries: u32,

    /// Remote collections mirrored by the scheduler, in pass order
    #[serde(default = "default_tracked_collections")]
    pub tracked_collections: Vec<String>,

    /// Remote document store
    #[serde(default)]
    pub firestore: FirestoreConfig,
}

/// Firestore REST endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirestoreConfig {
    /// GCP project id; sync is disabled when unset
    #[serde(default)]
    pub project_id: Option<String>,

    #[serde(default = "default_firestore_database")]
    pub database: String,

    #[serde(default = "default_firestore_base_url")]
    pub base_url: String,

    /// Documents per `documents.list` page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// OAuth bearer token. Prefer FIRESTORE_TOKEN over writing it to disk.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

fn default_database_file() -> String {
    "trees.db".to_string()
}

fn default_sync_interval() -> u64 {
    300
}

fn default_retry_delay() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_outage_alert_threshold() -> u32 {
    3
}

fn default_id_suffix_width() -> usize {
    3
}

fn default_allocation_retries() -> u32 {
    5
}

fn default_tracked_collections() -> Vec<String> {
    vec![
        "institutions".to_string(),
        "users".to_string(),
        "trees".to_string(),
    ]
}

fn default_firestore_database() -> String {
    "(default)".to_string()
}

fn default_firestore_base_url() -> String {
    "https://firestore.googleapis.com/v1".to_string()
}

fn default_page_size() -> u32 {
    300
}

impl Default for FirestoreConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            database: default_firestore_database(),
            base_url: default_firestore_base_url(),
            page_size: default_page_size(),
            token: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            sync_interval_secs: 300,
            retry_delay_secs: 60,
            shutdown_grace_secs: 5,
            fetch_timeout_secs: 30,
            outage_alert_threshold: 3,
            id_suffix_width: 3,
            allocation_retries: 5,
            tracked_collections: default_tracked_collections(),
            firestore: FirestoreConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get SQLite database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            sync_interval_secs = 30

            [firestore]
            project_id = "carbontally"
            "#,
        )
        .unwrap();

        assert_eq!(config.sync_interval_secs, 30);
        assert_eq!(config.retry_delay_secs, 60);
        assert_eq!(config.id_suffix_width, 3);
        assert_eq!(config.tracked_collections, vec!["institutions", "users", "trees"]);
        assert_eq!(config.firestore.project_id.as_deref(), Some("carbontally"));
        assert_eq!(config.firestore.database, "(default)");
    }

    #[test]
    fn test_token_is_not_saved() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.firestore.token = Some("secret".to_string());
        config.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret"));

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.firestore.token.is_none());
        assert_eq!(loaded.database_file, "trees.db");
    }
}
