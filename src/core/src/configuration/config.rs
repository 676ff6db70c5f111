use super::types::*;
use crate::error_handling::types::ConfigError;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration structure that defines all runtime parameters.
///
/// This structure holds the complete configuration of the bastion: listening addresses for the
/// operator-facing acceptor and the web front, recording settings, connection limits and the
/// static asset inventory. It is read from a TOML file and a handful of values can be
/// overridden from the command line (see [`ConfigOverrides`]).
///
/// # Examples
///
/// ```
/// use sas::configuration::Config;
///
/// let config = Config::from_toml_str("sshd_port = 2223").unwrap();
/// assert_eq!(config.sshd_port, 2223);
/// assert_eq!(config.httpd_port, 5000);
/// ```
///
/// # Fields Overview
///
/// - `name`: name of this bastion instance, shown in the greeting
/// - `bind_host`: address both listeners bind to
/// - `sshd_port`: operator acceptor port, `0` disables it
/// - `httpd_port`: web front (session listing and websocket bridge) port, `0` disables it
/// - `key_dir`: directory holding the persisted host key
/// - `log_dir`: directory receiving replay files and the command log
/// - `max_connections`: upper bound of concurrently handled operator connections
/// - `heartbeat_interval_secs`: period of the session monitor
/// - `negotiation_timeout_secs`: how long a connection may take to request a channel
/// - `recording`: segmentation and recorder settings
/// - `assets` / `tokens`: static inventory used for authorization
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub bind_host: String,
    pub sshd_port: u16,
    pub httpd_port: u16,
    pub key_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_connections: usize,
    pub heartbeat_interval_secs: u64,
    pub negotiation_timeout_secs: u64,
    pub recording: RecordingConfig,
    pub assets: Vec<AssetConfig>,
    pub tokens: Vec<TokenConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::from("sas"),
            bind_host: String::from("0.0.0.0"),
            sshd_port: 2222,
            httpd_port: 5000,
            key_dir: PathBuf::from("keys"),
            log_dir: PathBuf::from("logs"),
            max_connections: 500,
            heartbeat_interval_secs: 5,
            negotiation_timeout_secs: 5,
            recording: RecordingConfig::default(),
            assets: Vec::new(),
            tokens: Vec::new(),
        }
    }
}

impl Config {
    /// Reads and validates the configuration stored at `path`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::IoError`] when the file cannot be read
    /// - [`ConfigError::TomlError`] when the content is not valid TOML for this structure
    /// - any validation error returned by [`Config::validate`]
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates a configuration held in memory.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies command line values on top of the file and validates the result again.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) -> Result<(), ConfigError> {
        if let Some(bind_host) = overrides.bind_host {
            self.bind_host = bind_host;
        }
        if let Some(port) = overrides.sshd_port {
            self.sshd_port = port;
        }
        if let Some(port) = overrides.httpd_port {
            self.httpd_port = port;
        }
        if let Some(log_dir) = overrides.log_dir {
            self.log_dir = PathBuf::from(log_dir);
        }
        self.validate()
    }

    /// Checks the cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_host.trim().is_empty() {
            return Err(ConfigError::MissingValue("bind_host".into()));
        }
        self.bind_host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::BadIPFormatting(self.bind_host.clone()))?;

        if self.sshd_port != 0 && self.sshd_port == self.httpd_port {
            return Err(ConfigError::BadPortsRange(format!(
                "sshd_port and httpd_port are both {}",
                self.sshd_port
            )));
        }

        if !(1..=10_000).contains(&self.max_connections) {
            return Err(ConfigError::NotInRange(format!(
                "max_connections must be within 1..=10000, got {}",
                self.max_connections
            )));
        }

        if self.recording.buffer_budget == 0 {
            return Err(ConfigError::NotInRange(
                "recording.buffer_budget must be positive".into(),
            ));
        }

        if self.recording.batch_size == 0 || self.recording.queue_size == 0 {
            return Err(ConfigError::NotInRange(
                "recording.batch_size and recording.queue_size must be positive".into(),
            ));
        }

        if self.recording.submit_markers.iter().all(|m| m.is_empty()) {
            return Err(ConfigError::MissingValue("recording.submit_markers".into()));
        }

        if let Some(ref marker) = self.recording.rz_marker_hex {
            hex::decode(marker).map_err(|e| {
                ConfigError::TomlError(format!("recording.rz_marker_hex: {}", e))
            })?;
        }

        for asset in &self.assets {
            asset
                .ip
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::BadIPFormatting(asset.ip.clone()))?;
        }

        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn host_key_path(&self) -> PathBuf {
        self.key_dir.join("host_key")
    }

    /// Submit markers as raw byte sequences, empty entries dropped.
    pub fn submit_markers(&self) -> Vec<Vec<u8>> {
        self.recording
            .submit_markers
            .iter()
            .filter(|m| !m.is_empty())
            .map(|m| m.as_bytes().to_vec())
            .collect()
    }

    /// Configured zmodem marker, validated at load time.
    pub fn rz_marker(&self) -> Option<Vec<u8>> {
        self.recording
            .rz_marker_hex
            .as_ref()
            .and_then(|m| hex::decode(m).ok())
    }
}
