use crate::error::AppError;
use photo_gallery::{CodecConfig, StoreConfig, SyncConfig, WebDavConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "listing-photos.toml";

/// Application configuration, read from a TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    /// URL probed with HEAD to estimate network quality; no probing when unset
    pub probe_url: Option<String>,
    pub codec: CodecConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
    pub webdav: WebDavConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/listing-photos.db"),
            probe_url: None,
            codec: CodecConfig::default(),
            sync: SyncConfig::default(),
            store: StoreConfig::default(),
            webdav: WebDavConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads the configuration; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            log::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        log::debug!("Loaded config from {:?}", path);
        Ok(config)
    }
}
