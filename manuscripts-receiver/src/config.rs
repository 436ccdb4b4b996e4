use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::NaiveDate;
use manuscripts_core::ReceiverMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::store::NamingScheme;

/// `receiver.json` is expected to be tiny; anything larger is not ours.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
pub const CONFIG_DIR_ENV: &str = "MANUSCRIPTS_CONFIG_DIR";
pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_DISPLAY_NAME: &str = "Teacher";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Values persisted between runs. Never holds the passphrase.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SavedConfig {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub naming: Option<NamingScheme>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub grace_secs: Option<u64>,
}

impl SavedConfig {
    /// Values set in `overrides` win.
    #[must_use]
    pub fn merged(self, overrides: SavedConfig) -> SavedConfig {
        SavedConfig {
            display_name: overrides.display_name.or(self.display_name),
            port: overrides.port.or(self.port),
            destination: overrides.destination.or(self.destination),
            naming: overrides.naming.or(self.naming),
            idle_timeout_secs: overrides.idle_timeout_secs.or(self.idle_timeout_secs),
            grace_secs: overrides.grace_secs.or(self.grace_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("metadata read failed: {0}")]
    Metadata(io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(io::Error),
    #[error("parse failed: {0}")]
    Parse(serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigSaveError {
    #[error("cannot create config directory: {0}")]
    CreateDir(io::Error),
    #[error("serialize failed: {0}")]
    Serialize(serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(io::Error),
    #[error("rename failed: {0}")]
    Rename(io::Error),
}

/// Fully resolved settings for one receiver run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub mode: ReceiverMode,
    pub display_name: String,
    pub port: u16,
    pub destination: PathBuf,
    pub naming: NamingScheme,
    pub idle_timeout: Duration,
    pub grace_period: Duration,
}

impl ReceiverConfig {
    pub fn resolve(saved: &SavedConfig, mode: ReceiverMode, today: NaiveDate) -> Self {
        Self {
            mode,
            display_name: saved
                .display_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or(DEFAULT_DISPLAY_NAME)
                .to_owned(),
            port: saved.port.unwrap_or(DEFAULT_PORT),
            destination: saved
                .destination
                .clone()
                .unwrap_or_else(|| default_destination(mode, today)),
            naming: saved.naming.unwrap_or_default(),
            idle_timeout: saved
                .idle_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            grace_period: saved
                .grace_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_GRACE_PERIOD),
        }
    }
}

pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("manuscripts")
}

pub fn config_path(mode: ReceiverMode) -> PathBuf {
    config_dir().join(format!("{}.json", mode.as_str()))
}

pub fn downloads_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
}

/// Receiver mode files each day's work into its own folder.
pub fn default_destination(mode: ReceiverMode, today: NaiveDate) -> PathBuf {
    match mode {
        ReceiverMode::Receiver => downloads_dir()
            .join("Submissions")
            .join(today.format("%Y-%m-%d").to_string()),
        ReceiverMode::Share => downloads_dir().join("Shared"),
    }
}

pub fn parse_config_json(data: &str) -> Result<SavedConfig, serde_json::Error> {
    serde_json::from_str::<SavedConfig>(data)
}

pub fn load_config_from_path(path: &Path) -> Result<SavedConfig, ConfigLoadError> {
    let meta = fs::metadata(path).map_err(ConfigLoadError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigLoadError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigLoadError::Read)?;
    parse_config_json(&data).map_err(ConfigLoadError::Parse)
}

/// A missing file is the normal first-run case; other problems are logged
/// and the defaults used.
pub fn load_config(mode: ReceiverMode) -> SavedConfig {
    let path = config_path(mode);
    match load_config_from_path(&path) {
        Ok(config) => config,
        Err(ConfigLoadError::Metadata(err)) if err.kind() == io::ErrorKind::NotFound => {
            SavedConfig::default()
        }
        Err(err) => {
            warn!(path = %path.display(), "ignoring saved config: {err}");
            SavedConfig::default()
        }
    }
}

pub fn save_config_to_path(path: &Path, config: &SavedConfig) -> Result<(), ConfigSaveError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(ConfigSaveError::CreateDir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(config).map_err(ConfigSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(ConfigSaveError::WriteTmp)?;
    fs::rename(&tmp, path).map_err(ConfigSaveError::Rename)?;
    Ok(())
}

pub fn save_config(mode: ReceiverMode, config: &SavedConfig) -> Result<PathBuf, ConfigSaveError> {
    let path = config_path(mode);
    save_config_to_path(&path, config)?;
    Ok(path)
}
