//! WebDAV upload gateway and network probe
//!
//! Photos are PUT to `<remote_path>/<container>/<filename>` below the user's
//! Nextcloud files root. The container collection is created with MKCOL the
//! first time it is used; MKCOL failures are ignored because the collection
//! usually exists already.

use crate::conditions::{classify_latency, ConditionsProvider, DeviceConditions, NetworkQuality};
use crate::gateway::{UploadError, UploadGateway, UploadedObject};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Connection settings for a WebDAV (Nextcloud) server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDavConfig {
    pub server_url: String,
    pub username: String,
    pub password: String,
    /// Folder below the user's files root that holds all containers
    pub remote_path: String,
}

impl WebDavConfig {
    pub fn is_configured(&self) -> bool {
        !self.server_url.is_empty() && !self.username.is_empty()
    }

    /// Nextcloud WebDAV endpoint of the configured user
    pub fn webdav_url(&self) -> String {
        format!(
            "{}/remote.php/dav/files/{}",
            self.server_url.trim_end_matches('/'),
            self.username
        )
    }
}

pub struct WebDavGateway {
    client: reqwest_dav::Client,
    base_url: String,
    remote_path: String,
    /// Collections already created (or found) during this process
    known_collections: Mutex<HashSet<String>>,
}

impl WebDavGateway {
    pub fn new(config: &WebDavConfig) -> Result<Self, UploadError> {
        let base_url = config.webdav_url();
        let client = reqwest_dav::ClientBuilder::new()
            .set_host(base_url.clone())
            .set_auth(reqwest_dav::Auth::Basic(
                config.username.clone(),
                config.password.clone(),
            ))
            .build()
            .map_err(|e| UploadError::Rejected(format!("WebDAV client error: {:?}", e)))?;

        Ok(Self {
            client,
            base_url,
            remote_path: config.remote_path.trim_matches('/').to_string(),
            known_collections: Mutex::new(HashSet::new()),
        })
    }

    fn collection_path(&self, container_id: &str) -> String {
        let container = container_id.trim_matches('/');
        if self.remote_path.is_empty() {
            container.to_string()
        } else {
            format!("{}/{}", self.remote_path, container)
        }
    }

    fn is_known(&self, path: &str) -> bool {
        self.known_collections
            .lock()
            .map(|known| known.contains(path))
            .unwrap_or(false)
    }

    /// Creates every level of `path`; errors are logged and otherwise ignored.
    async fn ensure_collection(&self, path: &str) {
        if self.is_known(path) {
            return;
        }

        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);

            if let Err(e) = self.client.mkcol(&current).await {
                log::debug!("MKCOL '{}' note: {:?}", current, e);
            }
        }

        if let Ok(mut known) = self.known_collections.lock() {
            known.insert(path.to_string());
        }
    }
}

#[async_trait]
impl UploadGateway for WebDavGateway {
    async fn upload(
        &self,
        container_id: &str,
        bytes: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<UploadedObject, UploadError> {
        let collection = self.collection_path(container_id);
        self.ensure_collection(&collection).await;

        let remote = format!("{}/{}", collection, filename);
        let size = bytes.len();
        self.client
            .put(&remote, bytes)
            .await
            .map_err(|e| UploadError::Network(format!("PUT {} failed: {:?}", remote, e)))?;

        log::info!("Uploaded {} ({}, {} bytes)", remote, content_type, size);
        Ok(UploadedObject {
            key: format!("{}/{}", container_id.trim_matches('/'), filename),
            url: format!("{}/{}", self.base_url, remote),
        })
    }
}

/// Wraps a conditions source and measures network quality with a timed HEAD request.
pub struct ProbedConditions {
    inner: Arc<dyn ConditionsProvider>,
    http: reqwest::Client,
    probe_url: String,
}

impl ProbedConditions {
    const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(
        inner: Arc<dyn ConditionsProvider>,
        probe_url: impl Into<String>,
    ) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(Self::PROBE_TIMEOUT)
            .build()
            .map_err(|e| UploadError::Network(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            inner,
            http,
            probe_url: probe_url.into(),
        })
    }

    async fn probe(&self) -> NetworkQuality {
        let started = Instant::now();
        match self.http.head(&self.probe_url).send().await {
            Ok(_) => classify_latency(started.elapsed()),
            Err(e) => {
                log::debug!("Network probe to {} failed: {}", self.probe_url, e);
                NetworkQuality::Poor
            }
        }
    }
}

#[async_trait]
impl ConditionsProvider for ProbedConditions {
    async fn current(&self) -> DeviceConditions {
        let mut conditions = self.inner.current().await;
        if conditions.is_online {
            conditions.network_quality = self.probe().await;
        }
        conditions
    }

    fn changes(&self) -> Option<watch::Receiver<DeviceConditions>> {
        self.inner.changes()
    }
}
