//! # Photo Gallery
//!
//! Offline-first photo capture and background upload sync.
//!
//! This crate provides:
//! - Validation, resizing, compression and thumbnails for captured images
//! - A durable SQLite store for photos and their sync state
//! - A sync engine uploading pending photos in bounded, cancellable batches
//! - Progress notifications and a background trigger (timer + reconnect)
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use photo_gallery::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(PhotoStore::open("photos.db", StoreConfig::default())?);
//! let gallery = PhotoGalleryService::new(store.clone(), CodecConfig::default());
//! gallery.add_photo(NewPhoto { /* ... */ })?;
//!
//! let engine = Arc::new(PhotoSyncEngine::new(
//!     store,
//!     Arc::new(WebDavGateway::new(&webdav)?),
//!     Arc::new(FixedConditions::default()),
//!     ProgressBus::new(),
//!     SyncConfig::default(),
//! ));
//! let result = engine.start_sync(SyncOptions::default()).await?;
//! ```

pub mod background;
pub mod codec;
pub mod conditions;
pub mod config;
pub mod gateway;
pub mod models;
pub mod progress;
pub mod scheduler;
pub mod schema;
pub mod service;
pub mod store;

#[cfg(feature = "sync")]
pub mod upload;

pub use background::{BackgroundSync, SyncLogEntry};
pub use codec::{
    calculate_dimensions, compress, format_file_size, generate_thumbnail, validate_image_file,
    CodecError, CompressedImage, ImageCodec, ImageCrateCodec, ValidationError,
};
pub use conditions::{
    should_continue, should_sync, should_sync_with, ConditionsProvider, DeviceConditions,
    FixedConditions, NetworkQuality, SyncConditions,
};
pub use config::{CodecConfig, StoreConfig, SyncConfig};
pub use gateway::{UploadError, UploadGateway, UploadedObject};
pub use models::{
    GallerySummary, ImageFile, ImageFormat, NewPhoto, PhotoRecord, RecordError, StorageEstimate,
    SyncOptions, SyncResult, SyncStatus, SyncStatusReport,
};
pub use progress::{PhotoUploadProgress, ProgressBus, Subscription, UploadPhase};
pub use scheduler::{PhotoSyncEngine, SyncError};
pub use schema::init_photo_schema;
pub use service::{GalleryError, PhotoGalleryService};
pub use store::{PhotoStore, StoreError, StoreResult};

#[cfg(feature = "sync")]
pub use upload::{ProbedConditions, WebDavConfig, WebDavGateway};
