use crate::codec::{
    compress_with, generate_thumbnail_with, validate_image_file, CodecError, ImageCodec,
    ImageCrateCodec, ValidationError,
};
use crate::config::CodecConfig;
use crate::models::{GallerySummary, NewPhoto, PhotoRecord, SyncStatus};
use crate::store::{PhotoStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Error type for photo gallery operations
#[derive(Debug)]
pub enum GalleryError {
    Validation(ValidationError),
    Codec(CodecError),
    Store(StoreError),
}

impl std::fmt::Display for GalleryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GalleryError::Validation(e) => write!(f, "Invalid photo: {}", e),
            GalleryError::Codec(e) => write!(f, "{}", e),
            GalleryError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GalleryError {}

impl From<ValidationError> for GalleryError {
    fn from(err: ValidationError) -> Self {
        GalleryError::Validation(err)
    }
}

impl From<CodecError> for GalleryError {
    fn from(err: CodecError) -> Self {
        GalleryError::Codec(err)
    }
}

impl From<StoreError> for GalleryError {
    fn from(err: StoreError) -> Self {
        GalleryError::Store(err)
    }
}

/// Photo Gallery Service
///
/// Turns captured files into stored, upload-ready records and answers the
/// gallery's read queries.
pub struct PhotoGalleryService {
    store: Arc<PhotoStore>,
    config: CodecConfig,
    codec: Arc<dyn ImageCodec>,
}

impl PhotoGalleryService {
    pub fn new(store: Arc<PhotoStore>, config: CodecConfig) -> Self {
        Self::with_codec(store, config, Arc::new(ImageCrateCodec::default()))
    }

    pub fn with_codec(
        store: Arc<PhotoStore>,
        config: CodecConfig,
        codec: Arc<dyn ImageCodec>,
    ) -> Self {
        Self {
            store,
            config,
            codec,
        }
    }

    pub fn store(&self) -> &Arc<PhotoStore> {
        &self.store
    }

    /// Validates, compresses and thumbnails a photo, then stores it as pending.
    ///
    /// Nothing is stored when validation or processing fails. This is CPU
    /// bound; async callers should run it on a blocking thread.
    pub fn add_photo(&self, photo: NewPhoto) -> Result<PhotoRecord, GalleryError> {
        validate_image_file(&photo.file, &self.config)?;

        let compressed = compress_with(self.codec.as_ref(), &photo.file.bytes, &self.config)?;
        let thumbnail = generate_thumbnail_with(
            self.codec.as_ref(),
            &photo.file.bytes,
            self.config.thumbnail_size,
            self.config.output_format,
            self.config.quality,
        )?;

        let record = PhotoRecord {
            id: Uuid::new_v4(),
            owner_user_id: photo.owner_user_id,
            product_id: photo.product_id,
            category: photo.category,
            size: compressed.compressed_size,
            width: compressed.width,
            height: compressed.height,
            format: compressed.format,
            quality: self.config.quality,
            bytes: compressed.bytes,
            thumbnail_bytes: thumbnail,
            // The store keeps millisecond precision
            timestamp: DateTime::from_timestamp_millis(Utc::now().timestamp_millis())
                .unwrap_or_else(Utc::now),
            sync_status: SyncStatus::Pending,
            upload_key: None,
            upload_url: None,
            retry_count: 0,
            sync_error: None,
            last_sync_attempt: None,
        };
        self.store.put(&record)?;

        log::info!(
            "Added photo {} ({}, {}x{}) for user {}",
            record.id,
            photo.file.name,
            record.width,
            record.height,
            record.owner_user_id
        );
        Ok(record)
    }

    pub fn gallery_summary(&self, user_id: &str) -> Result<GallerySummary, GalleryError> {
        let photos = self.store.query_by_user(user_id)?;
        let total_size = photos.iter().map(|p| p.size).sum();
        let sync_pending = photos
            .iter()
            .filter(|p| p.sync_status.is_awaiting_upload())
            .count();

        Ok(GallerySummary {
            photos,
            total_size,
            sync_pending,
            last_sync: self.store.last_sync()?,
        })
    }

    pub fn photos_for_product(&self, product_id: &str) -> Result<Vec<PhotoRecord>, GalleryError> {
        Ok(self.store.query_by_product(product_id)?)
    }

    pub fn delete_photo(&self, id: &Uuid) -> Result<(), GalleryError> {
        self.store.delete(id)?;
        log::info!("Deleted photo {}", id);
        Ok(())
    }

    /// Deletes a user's oldest photos beyond the configured per-user cap
    pub fn cleanup_old_photos(&self, user_id: &str) -> Result<usize, GalleryError> {
        let keep = self.store.config().max_photos_per_user;
        Ok(self.store.cleanup_oldest(user_id, keep)?)
    }
}
