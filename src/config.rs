//! Engine configuration
//!
//! This module contains all configuration options for the download engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Main configuration for the download engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory to save downloads
    pub download_dir: PathBuf,

    /// Maximum downloads active at once
    pub max_concurrent_downloads: usize,

    /// Maximum transfer tasks per download
    pub split: usize,

    /// Piece length used for stream downloads
    pub min_split_size: u64,

    /// Upper bound on one poll wait, in milliseconds
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Per-download stall timeout in seconds
    pub timeout_secs: u64,

    /// Transfer respawns allowed before a download is aborted (0 = unlimited)
    #[serde(default)]
    pub max_resume_failure_tries: u32,

    /// "Not found" answers tolerated before a download is aborted (0 = unlimited)
    #[serde(default)]
    pub max_file_not_found: u32,

    /// Per-download download speed limit (bytes/sec, 0 = unlimited)
    #[serde(default)]
    pub max_download_limit: u64,

    /// Per-download upload speed limit (bytes/sec, 0 = unlimited)
    #[serde(default)]
    pub max_upload_limit: u64,

    /// Ignore the netrc file when resolving credentials
    #[serde(default)]
    pub no_netrc: bool,

    /// HTTP configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// FTP configuration
    #[serde(default)]
    pub ftp: FtpConfig,

    /// BitTorrent configuration
    #[serde(default)]
    pub torrent: TorrentConfig,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Default HTTP user
    pub user: Option<String>,

    /// Default HTTP password
    pub passwd: Option<String>,

    /// Send credentials only after the server asks for them
    #[serde(default)]
    pub auth_challenge: bool,
}

/// FTP-specific configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FtpConfig {
    /// Default FTP user
    pub user: Option<String>,

    /// Default FTP password
    pub passwd: Option<String>,
}

/// BitTorrent-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentConfig {
    /// Enable DHT
    pub enable_dht: bool,

    /// UDP port shared by DHT and UDP tracker traffic
    pub dht_listen_port: u16,

    /// DHT bootstrap nodes
    pub dht_bootstrap_nodes: Vec<String>,

    /// Seconds before an unanswered DHT query times out
    #[serde(default = "default_dht_message_timeout_secs")]
    pub dht_message_timeout_secs: u64,

    /// Seconds between routing table bucket refreshes
    #[serde(default = "default_dht_bucket_refresh_secs")]
    pub dht_bucket_refresh_secs: u64,

    /// Seconds before an unanswered UDP tracker request is retried
    #[serde(default = "default_udp_tracker_timeout_secs")]
    pub udp_tracker_timeout_secs: u64,

    /// Retries of a UDP tracker request before it fails with a timeout
    #[serde(default = "default_udp_tracker_max_retries")]
    pub udp_tracker_max_retries: u32,

    /// Lifetime of a UDP tracker connection id in seconds
    #[serde(default = "default_udp_tracker_connection_id_ttl_secs")]
    pub udp_tracker_connection_id_ttl_secs: u64,
}

fn default_refresh_interval_ms() -> u64 {
    100
}

fn default_dht_message_timeout_secs() -> u64 {
    10
}

fn default_dht_bucket_refresh_secs() -> u64 {
    15 * 60
}

fn default_udp_tracker_timeout_secs() -> u64 {
    15
}

fn default_udp_tracker_max_retries() -> u32 {
    3
}

fn default_udp_tracker_connection_id_ttl_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent_downloads: 5,
            split: 5,
            min_split_size: 1024 * 1024, // 1 MiB
            refresh_interval_ms: default_refresh_interval_ms(),
            timeout_secs: 60,
            max_resume_failure_tries: 0,
            max_file_not_found: 0,
            max_download_limit: 0,
            max_upload_limit: 0,
            no_netrc: false,
            http: HttpConfig::default(),
            ftp: FtpConfig::default(),
            torrent: TorrentConfig::default(),
        }
    }
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            enable_dht: true,
            dht_listen_port: 6881,
            dht_bootstrap_nodes: vec![
                "router.bittorrent.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
            ],
            dht_message_timeout_secs: default_dht_message_timeout_secs(),
            dht_bucket_refresh_secs: default_dht_bucket_refresh_secs(),
            udp_tracker_timeout_secs: default_udp_tracker_timeout_secs(),
            udp_tracker_max_retries: default_udp_tracker_max_retries(),
            udp_tracker_connection_id_ttl_secs: default_udp_tracker_connection_id_ttl_secs(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download directory
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Set maximum concurrent downloads
    pub fn max_concurrent_downloads(mut self, max: usize) -> Self {
        self.max_concurrent_downloads = max;
        self
    }

    /// Set maximum transfer tasks per download
    pub fn split(mut self, split: usize) -> Self {
        self.split = split;
        self
    }

    /// Set the stream piece length
    pub fn min_split_size(mut self, size: u64) -> Self {
        self.min_split_size = size;
        self
    }

    /// Set the poll wait upper bound
    pub fn refresh_interval_ms(mut self, ms: u64) -> Self {
        self.refresh_interval_ms = ms;
        self
    }

    /// Set per-download download speed limit (0 = unlimited)
    pub fn download_limit(mut self, limit: u64) -> Self {
        self.max_download_limit = limit;
        self
    }

    /// Set per-download upload speed limit (0 = unlimited)
    pub fn upload_limit(mut self, limit: u64) -> Self {
        self.max_upload_limit = limit;
        self
    }

    /// Set the transfer respawn threshold
    pub fn max_resume_failure_tries(mut self, tries: u32) -> Self {
        self.max_resume_failure_tries = tries;
        self
    }

    /// Enable or disable DHT
    pub fn enable_dht(mut self, enabled: bool) -> Self {
        self.torrent.enable_dht = enabled;
        self
    }

    /// Set default HTTP credentials
    pub fn http_credentials(mut self, user: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.http.user = Some(user.into());
        self.http.passwd = Some(passwd.into());
        self
    }

    /// Set default FTP credentials
    pub fn ftp_credentials(mut self, user: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.ftp.user = Some(user.into());
        self.ftp.passwd = Some(passwd.into());
        self
    }

    /// Ignore the netrc file
    pub fn no_netrc(mut self, no_netrc: bool) -> Self {
        self.no_netrc = no_netrc;
        self
    }

    /// Poll wait upper bound as a duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Stall timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.download_dir.exists() {
            return Err(EngineError::invalid_input(
                "download_dir",
                format!("Directory does not exist: {:?}", self.download_dir),
            ));
        }

        if !self.download_dir.is_dir() {
            return Err(EngineError::invalid_input(
                "download_dir",
                format!("Path is not a directory: {:?}", self.download_dir),
            ));
        }

        if self.max_concurrent_downloads == 0 {
            return Err(EngineError::invalid_input(
                "max_concurrent_downloads",
                "Must be at least 1",
            ));
        }

        if self.split == 0 {
            return Err(EngineError::invalid_input("split", "Must be at least 1"));
        }

        if self.min_split_size == 0 {
            return Err(EngineError::invalid_input(
                "min_split_size",
                "Must be at least 1",
            ));
        }

        if self.refresh_interval_ms == 0 {
            return Err(EngineError::invalid_input(
                "refresh_interval_ms",
                "Must be at least 1",
            ));
        }

        if self.torrent.udp_tracker_timeout_secs == 0 {
            return Err(EngineError::invalid_input(
                "udp_tracker_timeout_secs",
                "Must be at least 1",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_downloads, 5);
        assert_eq!(config.split, 5);
        assert_eq!(config.max_download_limit, 0);
        assert!(config.torrent.enable_dht);
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .max_concurrent_downloads(10)
            .split(8)
            .download_limit(1024 * 1024)
            .ftp_credentials("alice", "secret");

        assert_eq!(config.max_concurrent_downloads, 10);
        assert_eq!(config.split, 8);
        assert_eq!(config.max_download_limit, 1024 * 1024);
        assert_eq!(config.ftp.user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_config_validation() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new().download_dir(dir.path());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_download_dir() {
        let config = EngineConfig::new().download_dir("/nonexistent/path/12345");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_split_rejected() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new().download_dir(dir.path()).split(0);
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidInput { field: "split", .. })
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "download_dir": "/tmp",
            "max_concurrent_downloads": 2,
            "split": 3,
            "min_split_size": 4096,
            "timeout_secs": 30
        }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.refresh_interval_ms, 100);
        assert_eq!(config.torrent.udp_tracker_max_retries, 3);
        assert!(!config.http.auth_challenge);
    }
}
