//! Upload progress notifications
//!
//! Listeners register a callback on a [`ProgressBus`] and receive a
//! [`PhotoUploadProgress`] for every phase change of every upload. A callback
//! that panics is logged and skipped; the remaining listeners and the upload
//! itself are unaffected.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPhase {
    Preparing,
    Uploading,
    Processing,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhotoUploadProgress {
    pub record_id: Uuid,
    /// Always within `0..=100`
    pub progress_percent: u8,
    pub phase: UploadPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhotoUploadProgress {
    pub fn new(record_id: Uuid, phase: UploadPhase, progress_percent: u8) -> Self {
        Self {
            record_id,
            progress_percent: progress_percent.min(100),
            phase,
            error: None,
        }
    }

    pub fn failed(record_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            record_id,
            progress_percent: 100,
            phase: UploadPhase::Error,
            error: Some(error.into()),
        }
    }
}

type Callback = Arc<dyn Fn(&PhotoUploadProgress) + Send + Sync>;

struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Callback)>>,
    /// (completed, total) of the current sync pass
    overall: watch::Sender<(usize, usize)>,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<(u64, Callback)>> {
        // Callbacks never run under this lock, so a poisoned guard still holds a valid list
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Publish/subscribe hub for upload progress. Cloning shares the subscriber list.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        let (overall, _) = watch::channel((0, 0));
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
                overall,
            }),
        }
    }

    /// Registers `callback` until the returned [`Subscription`] is unsubscribed.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PhotoUploadProgress) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().push((id, Arc::new(callback)));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Delivers `event` to every current subscriber.
    pub fn emit(&self, event: PhotoUploadProgress) {
        let snapshot: Vec<Callback> = self
            .inner
            .subscribers()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                log::error!(
                    "Progress subscriber panicked on {:?} event for photo {}",
                    event.phase,
                    event.record_id
                );
            }
        }
    }

    /// Watch channel of `(completed, total)` for the running sync pass
    pub fn overall(&self) -> watch::Receiver<(usize, usize)> {
        self.inner.overall.subscribe()
    }

    pub(crate) fn begin_pass(&self, total: usize) {
        self.inner.overall.send_replace((0, total));
    }

    pub(crate) fn advance(&self) {
        self.inner.overall.send_modify(|(done, total)| {
            *done = (*done + 1).min(*total);
        });
    }
}

/// Handle returned by [`ProgressBus::subscribe`]
#[must_use = "dropping a Subscription keeps the callback registered; call unsubscribe() to remove it"]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers().retain(|(id, _)| *id != self.id);
        }
    }
}
