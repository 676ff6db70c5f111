pub mod config;
pub mod types;

pub use config::Config;
pub use types::{AssetConfig, CommandStorageKind, ConfigOverrides, RecordingConfig, TokenConfig};
