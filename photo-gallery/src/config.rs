use crate::models::ImageFormat;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Media codec settings applied when a photo is captured or imported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Largest accepted input file in bytes
    pub max_file_size: u64,
    /// Encoder quality in `0.0..=1.0` (only JPEG is lossy)
    pub quality: f32,
    pub target_width: u32,
    pub target_height: u32,
    /// Accepted input formats
    pub formats: Vec<ImageFormat>,
    /// Edge length of the square thumbnail
    pub thumbnail_size: u32,
    /// Format of the processed photo and its thumbnail
    pub output_format: ImageFormat,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_file_size: 5 * 1024 * 1024,
            quality: 0.8,
            target_width: 1200,
            target_height: 1200,
            formats: vec![ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Webp],
            thumbnail_size: 200,
            output_format: ImageFormat::Jpeg,
        }
    }
}

/// Sync scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_retries: u32,
    /// Pause after a batch that had failures
    pub retry_delay_ms: u64,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub network_timeout_ms: u64,
    pub min_battery_level: f32,
    pub wifi_only: bool,
    /// Remote container photos are uploaded into
    pub container_id: String,
    /// Interval of the background trigger
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            batch_size: 5,
            max_concurrent: 2,
            network_timeout_ms: 30_000,
            min_battery_level: 0.2,
            wifi_only: false,
            container_id: "photos".to_string(),
            interval_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Local store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound for the database size in bytes
    pub quota_bytes: u64,
    /// Retention cap used by [`crate::PhotoGalleryService::cleanup_old_photos`]
    pub max_photos_per_user: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            quota_bytes: 1024 * 1024 * 1024,
            max_photos_per_user: 100,
        }
    }
}
