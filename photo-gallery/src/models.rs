use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Position of a photo in the upload lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "syncing" => Some(SyncStatus::Syncing),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    /// Whether a record in this status may move to `next`.
    ///
    /// `Synced` is terminal. `Failed` only leaves through an explicit retry
    /// reset to `Pending`.
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        matches!(
            (self, next),
            (SyncStatus::Pending, SyncStatus::Syncing)
                | (SyncStatus::Failed, SyncStatus::Pending)
                | (SyncStatus::Syncing, SyncStatus::Synced)
                | (SyncStatus::Syncing, SyncStatus::Pending)
                | (SyncStatus::Syncing, SyncStatus::Failed)
        )
    }

    /// Pending and failed photos both count as "not yet uploaded" in the gallery.
    pub fn is_awaiting_upload(self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoded image formats the codec understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Webp => "image/webp",
        }
    }

    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/png" => Some(ImageFormat::Png),
            "image/webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }
}

/// A captured or uploaded photo together with its sync state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhotoRecord {
    pub id: Uuid,
    pub owner_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    pub category: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    #[serde(skip)]
    pub thumbnail_bytes: Vec<u8>,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub quality: f32,
    pub timestamp: DateTime<Utc>,
    pub sync_status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_attempt: Option<DateTime<Utc>>,
}

impl PhotoRecord {
    /// Name under which the photo is stored remotely
    pub fn filename(&self) -> String {
        format!("{}.{}", self.id, self.format.extension())
    }
}

/// Raw file handed to the gallery by the capture UI or a file picker
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImageFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Reads a file from disk, guessing the MIME type from its extension
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("photo")
            .to_string();
        Ok(Self {
            name,
            mime_type: crate::codec::mime_from_extension(path).to_string(),
            bytes,
        })
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Input for [`crate::PhotoGalleryService::add_photo`]
#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub owner_user_id: String,
    pub product_id: Option<String>,
    pub category: String,
    pub file: ImageFile,
}

/// Derived view over all photos of one user
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GallerySummary {
    pub photos: Vec<PhotoRecord>,
    pub total_size: u64,
    pub sync_pending: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Local storage consumption in bytes
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StorageEstimate {
    pub used: u64,
    pub available: u64,
    pub quota: u64,
}

/// Options for a single sync pass. Unset fields fall back to [`crate::SyncConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub force: bool,
    pub wifi_only: Option<bool>,
    pub max_retries: Option<u32>,
}

/// A per-photo failure captured during a sync pass
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecordError {
    pub record_id: Uuid,
    pub error: String,
}

/// Outcome of one sync pass
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncResult {
    pub success: bool,
    pub synced_count: usize,
    pub failed_count: usize,
    pub errors: Vec<RecordError>,
}

impl SyncResult {
    pub fn empty() -> Self {
        Self {
            success: true,
            synced_count: 0,
            failed_count: 0,
            errors: Vec::new(),
        }
    }
}

/// Snapshot returned by [`crate::PhotoSyncEngine::get_sync_status`]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncStatusReport {
    pub in_progress: bool,
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
}
