//! Remote upload gateway abstraction
//!
//! The sync engine only needs "put these bytes somewhere durable and tell me
//! where". [`crate::upload::WebDavGateway`] implements this for Nextcloud and
//! other WebDAV servers; tests use scripted in-memory gateways.

use async_trait::async_trait;
use std::time::Duration;

/// Where an uploaded photo ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub key: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Transport-level failure (connection refused, DNS, reset, ...)
    Network(String),
    /// The server answered but did not accept the upload
    Rejected(String),
    Timeout(Duration),
    Cancelled,
}

impl UploadError {
    /// Whether this failure counts against the photo's retry budget
    pub fn counts_as_attempt(&self) -> bool {
        !matches!(self, UploadError::Cancelled)
    }
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Network(e) => write!(f, "Network error: {}", e),
            UploadError::Rejected(e) => write!(f, "Upload rejected: {}", e),
            UploadError::Timeout(d) => write!(f, "Upload timed out after {} ms", d.as_millis()),
            UploadError::Cancelled => write!(f, "Upload cancelled"),
        }
    }
}

impl std::error::Error for UploadError {}

#[async_trait]
pub trait UploadGateway: Send + Sync {
    async fn upload(
        &self,
        container_id: &str,
        bytes: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<UploadedObject, UploadError>;
}
