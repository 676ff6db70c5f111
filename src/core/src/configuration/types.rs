use serde::Deserialize;

/// Where segmented commands end up once they leave the queue.
#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommandStorageKind {
    /// JSON lines appended to `<log_dir>/commands.jsonl`
    #[default]
    File,
    /// Emitted through the log facade only
    Log,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct RecordingConfig {
    /// Byte sequences that mark a submitted line on the operator side
    pub submit_markers: Vec<String>,
    /// Hex encoded marker that opens a zmodem upload; spans starting with it are not commands
    pub rz_marker_hex: Option<String>,
    /// Aggregate byte budget of each segmentation buffer
    pub buffer_budget: usize,
    pub command_storage: CommandStorageKind,
    pub batch_size: usize,
    pub queue_size: usize,
    pub gzip_replay: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            submit_markers: vec!["\r".into(), "\n".into(), "\r\n".into()],
            rz_marker_hex: None,
            buffer_budget: 1024,
            command_storage: CommandStorageKind::File,
            batch_size: 10,
            queue_size: 10_000,
            gzip_replay: true,
        }
    }
}

/// One backend asset and the credential used to reach it.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct AssetConfig {
    pub hostname: String,
    pub ip: String,
    #[serde(default = "default_asset_port")]
    pub port: u16,
    pub system_user: String,
    /// Operator names allowed on this asset, `"*"` matches everyone
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

fn default_asset_port() -> u16 {
    22
}

/// Pre-issued browser token bound to one user and one asset.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct TokenConfig {
    pub token: String,
    pub user: String,
    pub asset: String,
}

/// Values coming from the command line that win over the file.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub bind_host: Option<String>,
    pub sshd_port: Option<u16>,
    pub httpd_port: Option<u16>,
    pub log_dir: Option<String>,
}
