use photo_gallery::{GalleryError, StoreError, SyncError, UploadError};
use std::fmt;

/// Central error type of the command line tool
#[derive(Debug)]
pub enum AppError {
    /// Unreadable or invalid configuration
    Config(String),
    /// Filesystem error
    Filesystem(std::io::Error),
    /// Photo rejected or not processable
    Gallery(GalleryError),
    /// Local photo store failure
    Store(StoreError),
    /// A sync pass could not start
    Sync(SyncError),
    /// Upload gateway could not be set up
    Upload(UploadError),
    /// General error
    Other(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Filesystem(e) => write!(f, "Filesystem error: {}", e),
            AppError::Gallery(e) => write!(f, "{}", e),
            AppError::Store(e) => write!(f, "{}", e),
            AppError::Sync(e) => write!(f, "Sync error: {}", e),
            AppError::Upload(e) => write!(f, "{}", e),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Filesystem(e)
    }
}

impl From<GalleryError> for AppError {
    fn from(e: GalleryError) -> Self {
        AppError::Gallery(e)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Store(e)
    }
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        AppError::Sync(e)
    }
}

impl From<UploadError> for AppError {
    fn from(e: UploadError) -> Self {
        AppError::Upload(e)
    }
}

impl AppError {
    /// Short message for the terminal, without internal detail
    pub fn user_message(&self) -> String {
        match self {
            AppError::Config(msg) => format!("Please check the configuration: {}", msg),
            AppError::Filesystem(_) => "Error accessing files. Please check permissions.".to_string(),
            AppError::Gallery(GalleryError::Validation(e)) => e.reason.clone(),
            AppError::Gallery(GalleryError::Codec(_)) => "The image could not be read.".to_string(),
            AppError::Gallery(GalleryError::Store(e)) | AppError::Store(e) => match e {
                StoreError::NotFound(msg) => format!("{} was not found.", msg),
                StoreError::QuotaExceeded { .. } => {
                    "Not enough local storage for this photo.".to_string()
                }
                _ => "A database error occurred. Please try again.".to_string(),
            },
            AppError::Sync(SyncError::AlreadyInProgress) => {
                "A sync is already running.".to_string()
            }
            AppError::Sync(SyncError::Offline) => {
                "You are offline. Photos will upload once you are back online.".to_string()
            }
            AppError::Sync(SyncError::WifiRequired) => {
                "Waiting for Wi-Fi before uploading photos.".to_string()
            }
            AppError::Sync(SyncError::Store(_)) => {
                "A database error occurred. Please try again.".to_string()
            }
            AppError::Upload(e) => format!("Upload setup failed: {}", e),
            AppError::Other(msg) => msg.clone(),
        }
    }
}
