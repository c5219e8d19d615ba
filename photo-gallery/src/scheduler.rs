//! Sync engine: uploads pending photos in bounded batches
//!
//! One call to [`PhotoSyncEngine::start_sync`] is one sync pass. The pass
//! drains the queue of `pending` photos batch by batch. `failed` photos wait
//! for [`PhotoSyncEngine::retry_failed_uploads`]. Within a batch at most `max_concurrent`
//! uploads run at once on a `JoinSet`; results are written back to the store
//! by the coordinating task only, so every status change goes through one
//! place.
//!
//! Each in-flight upload owns a child of the session's cancellation token.
//! Cancelling puts the photo back into its previous status without touching
//! the retry counter, while a timeout counts as a failed attempt.

use crate::conditions::{should_continue, should_sync_with, ConditionsProvider, DeviceConditions};
use crate::config::SyncConfig;
use crate::gateway::{UploadError, UploadGateway, UploadedObject};
use crate::models::{
    PhotoRecord, RecordError, SyncOptions, SyncResult, SyncStatus, SyncStatusReport,
};
use crate::progress::{PhotoUploadProgress, ProgressBus, UploadPhase};
use crate::store::{PhotoStore, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug)]
pub enum SyncError {
    /// Another pass is running and `force` was not set
    AlreadyInProgress,
    Offline,
    /// Wi-Fi only mode is active and the connection is metered
    WifiRequired,
    Store(StoreError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::AlreadyInProgress => write!(f, "A sync is already in progress"),
            SyncError::Offline => write!(f, "Device is offline"),
            SyncError::WifiRequired => write!(f, "Sync requires an unmetered connection"),
            SyncError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(err)
    }
}

#[derive(Default)]
struct EngineState {
    next_session_id: u64,
    /// Active passes and their root tokens
    sessions: HashMap<u64, CancellationToken>,
    /// Record id -> token of the upload currently holding it
    in_flight: HashMap<Uuid, CancellationToken>,
}

fn lock_state(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registration of one running pass.
///
/// Dropping it unregisters the pass and puts any photo it still holds in
/// `syncing` back to the status it had before, so an abandoned pass never
/// strands records.
struct SessionGuard {
    id: u64,
    token: CancellationToken,
    state: Arc<Mutex<EngineState>>,
    store: Arc<PhotoStore>,
    /// Photos this pass moved to `syncing`, with their previous status
    claimed: HashMap<Uuid, SyncStatus>,
}

impl SessionGuard {
    fn reserve(&self, id: Uuid) -> Option<CancellationToken> {
        let mut state = lock_state(&self.state);
        if state.in_flight.contains_key(&id) {
            return None;
        }
        let token = self.token.child_token();
        state.in_flight.insert(id, token.clone());
        Some(token)
    }

    fn mark_claimed(&mut self, id: Uuid, prior: SyncStatus) {
        self.claimed.insert(id, prior);
    }

    fn release(&mut self, id: &Uuid) -> Option<SyncStatus> {
        lock_state(&self.state).in_flight.remove(id);
        self.claimed.remove(id)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        for (id, prior) in self.claimed.drain() {
            if let Err(e) = self.store.update_sync_status(&id, prior, None, None) {
                log::warn!("Could not restore photo {} to {}: {}", id, prior, e);
            }
            lock_state(&self.state).in_flight.remove(&id);
        }
        lock_state(&self.state).sessions.remove(&self.id);
    }
}

struct TaskOutcome {
    id: Uuid,
    result: Result<UploadedObject, UploadError>,
}

#[derive(Default)]
struct PassTally {
    attempted: usize,
    synced: usize,
    failed: usize,
    errors: Vec<RecordError>,
}

impl PassTally {
    fn fail(&mut self, record_id: Uuid, error: impl Into<String>) {
        self.failed += 1;
        self.errors.push(RecordError {
            record_id,
            error: error.into(),
        });
    }

    fn into_result(self) -> SyncResult {
        SyncResult {
            success: self.failed == 0,
            synced_count: self.synced,
            failed_count: self.failed,
            errors: self.errors,
        }
    }
}

/// Whether a stored photo belongs in the work queue.
///
/// `Failed` photos stay out until `retry_failed_uploads` resets them.
fn is_eligible(record: &PhotoRecord) -> bool {
    record.sync_status == SyncStatus::Pending
}

/// Pause after a batch with failures: `retry_delay` plus up to half of it as jitter
fn failure_pause(retry_delay: Duration) -> Duration {
    use rand::Rng;

    let base = retry_delay.as_millis() as u64;
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

/// Uploads one photo, racing the gateway against the token and the timeout
async fn upload_photo(
    gateway: Arc<dyn UploadGateway>,
    progress: ProgressBus,
    record: PhotoRecord,
    container_id: String,
    timeout: Duration,
    token: CancellationToken,
) -> TaskOutcome {
    let id = record.id;
    let filename = record.filename();
    let content_type = record.format.mime_type();

    progress.emit(PhotoUploadProgress::new(id, UploadPhase::Uploading, 10));
    let upload = tokio::time::timeout(
        timeout,
        gateway.upload(&container_id, record.bytes, content_type, &filename),
    );

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(UploadError::Cancelled),
        outcome = upload => match outcome {
            Ok(result) => result,
            Err(_) => Err(UploadError::Timeout(timeout)),
        },
    };

    if result.is_ok() {
        progress.emit(PhotoUploadProgress::new(id, UploadPhase::Processing, 90));
    }
    TaskOutcome { id, result }
}

/// Explicitly constructed sync engine; share it with `Arc`.
pub struct PhotoSyncEngine {
    store: Arc<PhotoStore>,
    gateway: Arc<dyn UploadGateway>,
    conditions: Arc<dyn ConditionsProvider>,
    progress: ProgressBus,
    config: SyncConfig,
    state: Arc<Mutex<EngineState>>,
}

impl PhotoSyncEngine {
    pub fn new(
        store: Arc<PhotoStore>,
        gateway: Arc<dyn UploadGateway>,
        conditions: Arc<dyn ConditionsProvider>,
        progress: ProgressBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            conditions,
            progress,
            config,
            state: Arc::new(Mutex::new(EngineState::default())),
        }
    }

    pub fn progress(&self) -> &ProgressBus {
        &self.progress
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PhotoStore> {
        &self.store
    }

    pub fn is_syncing(&self) -> bool {
        !lock_state(&self.state).sessions.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        lock_state(&self.state).in_flight.len()
    }

    /// Change notifications of the conditions provider, if it has any
    pub fn conditions_changes(&self) -> Option<watch::Receiver<DeviceConditions>> {
        self.conditions.changes()
    }

    fn begin_session(&self, force: bool) -> Result<SessionGuard, SyncError> {
        let mut state = lock_state(&self.state);
        if !force && !state.sessions.is_empty() {
            return Err(SyncError::AlreadyInProgress);
        }

        state.next_session_id += 1;
        let id = state.next_session_id;
        let token = CancellationToken::new();
        state.sessions.insert(id, token.clone());

        Ok(SessionGuard {
            id,
            token,
            state: self.state.clone(),
            store: self.store.clone(),
            claimed: HashMap::new(),
        })
    }

    fn check_preconditions(
        &self,
        conditions: &DeviceConditions,
        options: &SyncOptions,
    ) -> Result<(), SyncError> {
        if !conditions.is_online {
            return Err(SyncError::Offline);
        }
        if options.wifi_only.unwrap_or(self.config.wifi_only) && !conditions.is_unmetered {
            return Err(SyncError::WifiRequired);
        }
        Ok(())
    }

    /// Pending photos, oldest first. Photos already being uploaded are skipped.
    fn build_queue(&self) -> Result<Vec<Uuid>, StoreError> {
        let pending = self.store.query_by_sync_status(SyncStatus::Pending)?;

        let state = lock_state(&self.state);
        Ok(pending
            .iter()
            .filter(|r| !state.in_flight.contains_key(&r.id))
            .map(|r| r.id)
            .collect())
    }

    /// Runs one sync pass over all pending photos.
    ///
    /// Per-photo failures end up in [`SyncResult::errors`]; only failed
    /// preconditions abort the pass, and they do so before any photo is
    /// touched.
    pub async fn start_sync(&self, options: SyncOptions) -> Result<SyncResult, SyncError> {
        let mut session = self.begin_session(options.force)?;

        let conditions = self.conditions.current().await;
        self.check_preconditions(&conditions, &options)?;

        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let queue = self.build_queue()?;
        if queue.is_empty() {
            log::debug!("Sync pass: nothing to upload");
            return Ok(SyncResult::empty());
        }

        log::info!("Starting sync pass {} with {} photos", session.id, queue.len());
        self.progress.begin_pass(queue.len());

        let tally = self.run_batches(&mut session, &queue, max_retries).await;

        if tally.attempted > 0 {
            if let Err(e) = self.store.set_last_sync(Utc::now()) {
                log::error!("Could not record last sync time: {}", e);
            }
        }

        let result = tally.into_result();
        log::info!(
            "Sync pass {} finished: {} synced, {} failed",
            session.id,
            result.synced_count,
            result.failed_count
        );
        Ok(result)
    }

    async fn run_batches(
        &self,
        session: &mut SessionGuard,
        queue: &[Uuid],
        max_retries: u32,
    ) -> PassTally {
        let mut tally = PassTally::default();
        let batch_size = self.config.batch_size.max(1);
        let max_concurrent = self.config.max_concurrent.max(1);
        let batch_count = queue.len().div_ceil(batch_size);

        for (index, batch) in queue.chunks(batch_size).enumerate() {
            let failed_before = tally.failed;
            let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();

            for &id in batch {
                if session.token.is_cancelled() {
                    break;
                }

                while join_set.len() >= max_concurrent {
                    if let Some(joined) = join_set.join_next().await {
                        self.settle(session, &mut tally, max_retries, joined);
                    }
                }
                // A cancel may have arrived while waiting for a free slot
                if session.token.is_cancelled() {
                    break;
                }

                match self.claim(session, id) {
                    Ok(Some((record, token))) => {
                        tally.attempted += 1;
                        self.progress
                            .emit(PhotoUploadProgress::new(id, UploadPhase::Preparing, 0));
                        join_set.spawn(upload_photo(
                            self.gateway.clone(),
                            self.progress.clone(),
                            record,
                            self.config.container_id.clone(),
                            self.config.network_timeout(),
                            token,
                        ));
                    }
                    Ok(None) => self.progress.advance(),
                    Err(e) => {
                        log::error!("Could not prepare photo {} for upload: {}", id, e);
                        tally.fail(id, e.to_string());
                        self.progress.advance();
                    }
                }
            }

            while let Some(joined) = join_set.join_next().await {
                self.settle(session, &mut tally, max_retries, joined);
            }
            self.sweep_orphans(session, &mut tally, max_retries);

            let is_last = index + 1 == batch_count;
            if session.token.is_cancelled() {
                log::info!("Sync pass {} cancelled", session.id);
                break;
            }
            if is_last {
                break;
            }

            let conditions = self.conditions.current().await;
            if !should_continue(&conditions) {
                log::info!(
                    "Sync pass {} stopped after batch {}: connection lost or data saver on",
                    session.id,
                    index + 1
                );
                break;
            }

            if tally.failed > failed_before {
                let pause = failure_pause(self.config.retry_delay());
                log::debug!("Batch had failures, pausing {} ms", pause.as_millis());
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = session.token.cancelled() => break,
                }
            }
        }

        tally
    }

    /// Reserves a queued photo and moves it to `syncing`.
    ///
    /// `Ok(None)` means the photo is no longer eligible (deleted, synced or
    /// already in flight elsewhere).
    fn claim(
        &self,
        session: &mut SessionGuard,
        id: Uuid,
    ) -> Result<Option<(PhotoRecord, CancellationToken)>, StoreError> {
        let Some(token) = session.reserve(id) else {
            log::debug!("Photo {} is already being uploaded", id);
            return Ok(None);
        };

        let record = match self.store.get(&id) {
            Ok(Some(record)) if is_eligible(&record) => record,
            Ok(_) => {
                session.release(&id);
                return Ok(None);
            }
            Err(e) => {
                session.release(&id);
                return Err(e);
            }
        };

        match self
            .store
            .update_sync_status(&id, SyncStatus::Syncing, None, None)
        {
            Ok(()) => {
                session.mark_claimed(id, record.sync_status);
                Ok(Some((record, token)))
            }
            Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound(_)) => {
                session.release(&id);
                Ok(None)
            }
            Err(e) => {
                session.release(&id);
                Err(e)
            }
        }
    }

    /// Writes the outcome of one upload task back to the store
    fn settle(
        &self,
        session: &mut SessionGuard,
        tally: &mut PassTally,
        max_retries: u32,
        joined: Result<TaskOutcome, JoinError>,
    ) {
        let TaskOutcome { id, result } = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                // The record id is recovered by sweep_orphans
                log::error!("Upload task ended abnormally: {}", e);
                return;
            }
        };

        let prior = session.claimed.get(&id).copied().unwrap_or(SyncStatus::Pending);
        match result {
            Ok(object) => match self.store.update_sync_status(
                &id,
                SyncStatus::Synced,
                Some(&object.key),
                Some(&object.url),
            ) {
                Ok(()) => {
                    tally.synced += 1;
                    log::debug!("Photo {} synced as {}", id, object.key);
                    self.progress
                        .emit(PhotoUploadProgress::new(id, UploadPhase::Complete, 100));
                }
                Err(StoreError::NotFound(_)) => {
                    log::info!("Photo {} was deleted while uploading", id);
                }
                Err(e) => {
                    log::error!("Photo {} uploaded but not marked synced: {}", id, e);
                    tally.fail(id, e.to_string());
                    self.progress.emit(PhotoUploadProgress::failed(id, e.to_string()));
                }
            },
            Err(upload_error) if !upload_error.counts_as_attempt() => {
                match self.store.update_sync_status(&id, prior, None, None) {
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => log::error!("Could not restore cancelled photo {}: {}", id, e),
                }
                log::info!("Upload of photo {} cancelled", id);
                self.progress
                    .emit(PhotoUploadProgress::failed(id, upload_error.to_string()));
            }
            Err(upload_error) => self.book_failure(tally, id, &upload_error.to_string(), max_retries),
        }

        session.release(&id);
        self.progress.advance();
    }

    fn book_failure(&self, tally: &mut PassTally, id: Uuid, error: &str, max_retries: u32) {
        match self.store.record_failure(&id, error, max_retries) {
            Ok(outcome) => log::warn!(
                "Upload of photo {} failed (attempt {}/{}, now {}): {}",
                id,
                outcome.retry_count,
                max_retries,
                outcome.status,
                error
            ),
            Err(StoreError::NotFound(_)) => {
                log::info!("Photo {} was deleted while uploading", id);
                return;
            }
            Err(e) => log::error!("Could not record failed upload of photo {}: {}", id, e),
        }
        tally.fail(id, error);
        self.progress.emit(PhotoUploadProgress::failed(id, error));
    }

    /// Books photos whose upload task vanished without reporting back
    fn sweep_orphans(&self, session: &mut SessionGuard, tally: &mut PassTally, max_retries: u32) {
        let orphans: Vec<Uuid> = session.claimed.keys().copied().collect();
        for id in orphans {
            self.book_failure(tally, id, "upload task aborted", max_retries);
            session.release(&id);
            self.progress.advance();
        }
    }

    /// Cancels every in-flight upload and ends all running passes.
    ///
    /// Returns the number of uploads that were in flight.
    pub fn cancel_all_uploads(&self) -> usize {
        let state = lock_state(&self.state);
        for token in state.sessions.values() {
            token.cancel();
        }
        for token in state.in_flight.values() {
            token.cancel();
        }
        let count = state.in_flight.len();
        if count > 0 {
            log::info!("Cancelled {} in-flight uploads", count);
        }
        count
    }

    /// Cancels the upload of one photo; `false` if it is not in flight.
    pub fn cancel_upload(&self, id: &Uuid) -> bool {
        match lock_state(&self.state).in_flight.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Gives every failed photo a fresh retry budget and runs a pass.
    pub async fn retry_failed_uploads(
        &self,
        options: SyncOptions,
    ) -> Result<SyncResult, SyncError> {
        if !options.force && self.is_syncing() {
            return Err(SyncError::AlreadyInProgress);
        }
        let conditions = self.conditions.current().await;
        self.check_preconditions(&conditions, &options)?;

        let reset = self.store.reset_failed()?;
        log::info!("Reset {} failed photos for retry", reset);
        self.start_sync(options).await
    }

    pub fn get_sync_status(&self) -> Result<SyncStatusReport, SyncError> {
        Ok(SyncStatusReport {
            in_progress: self.is_syncing(),
            pending_count: self.store.count_by_sync_status(SyncStatus::Pending)?,
            failed_count: self.store.count_by_sync_status(SyncStatus::Failed)?,
            last_sync: self.store.last_sync()?,
        })
    }

    /// Runs a pass only when current conditions make it worthwhile.
    ///
    /// Returns `Ok(None)` when nothing ran: no pending work, unsuitable
    /// conditions, or another pass already active.
    pub async fn sync_if_needed(&self) -> Result<Option<SyncResult>, SyncError> {
        if self.is_syncing() {
            return Ok(None);
        }

        let conditions = self.conditions.current().await;
        let pending = self.build_queue()?.len();
        if !should_sync_with(&conditions.with_pending(pending), self.config.min_battery_level) {
            log::debug!(
                "Skipping sync: {} queued, online={}, quality={:?}, battery={:.2}",
                pending,
                conditions.is_online,
                conditions.network_quality,
                conditions.battery_level
            );
            return Ok(None);
        }
        if self.config.wifi_only && !conditions.is_unmetered {
            log::debug!("Skipping sync: waiting for an unmetered connection");
            return Ok(None);
        }

        match self.start_sync(SyncOptions::default()).await {
            Ok(result) => Ok(Some(result)),
            Err(SyncError::AlreadyInProgress) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conditions::FixedConditions;
    use crate::config::StoreConfig;
    use crate::store::tests::sample_record;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Copy, PartialEq)]
    pub(crate) enum Mode {
        Succeed,
        Fail,
        Hang,
    }

    /// In-memory gateway with a switchable behaviour
    pub(crate) struct FakeGateway {
        fail: AtomicBool,
        hang: AtomicBool,
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
        /// Turned to data-saver mode after the first upload, when set
        flip_after_first: Option<Arc<FixedConditions>>,
    }

    impl FakeGateway {
        pub(crate) fn new(mode: Mode) -> Self {
            let gateway = Self {
                fail: AtomicBool::new(false),
                hang: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                flip_after_first: None,
            };
            gateway.set_mode(mode);
            gateway
        }

        pub(crate) fn set_mode(&self, mode: Mode) {
            self.fail.store(mode == Mode::Fail, Ordering::SeqCst);
            self.hang.store(mode == Mode::Hang, Ordering::SeqCst);
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UploadGateway for FakeGateway {
        async fn upload(
            &self,
            container_id: &str,
            _bytes: Vec<u8>,
            _content_type: &str,
            filename: &str,
        ) -> Result<UploadedObject, UploadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);

            if call == 0 {
                if let Some(conditions) = &self.flip_after_first {
                    conditions.set(DeviceConditions {
                        data_saver: true,
                        ..DeviceConditions::default()
                    });
                }
            }

            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(UploadError::Network("connection reset".to_string()));
            }
            Ok(UploadedObject {
                key: format!("{}/{}", container_id, filename),
                url: format!("https://cdn.example.com/{}/{}", container_id, filename),
            })
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            retry_delay_ms: 0,
            ..SyncConfig::default()
        }
    }

    struct Fixture {
        store: Arc<PhotoStore>,
        gateway: Arc<FakeGateway>,
        conditions: Arc<FixedConditions>,
        engine: Arc<PhotoSyncEngine>,
    }

    fn fixture_with(gateway: FakeGateway, config: SyncConfig) -> Fixture {
        let store = Arc::new(PhotoStore::open_in_memory(StoreConfig::default()).unwrap());
        let gateway = Arc::new(gateway);
        let conditions = Arc::new(FixedConditions::default());
        let engine = Arc::new(PhotoSyncEngine::new(
            store.clone(),
            gateway.clone(),
            conditions.clone(),
            ProgressBus::new(),
            config,
        ));
        Fixture {
            store,
            gateway,
            conditions,
            engine,
        }
    }

    fn fixture(mode: Mode) -> Fixture {
        fixture_with(FakeGateway::new(mode), test_config())
    }

    fn add_records(store: &PhotoStore, count: usize) -> Vec<Uuid> {
        (0..count)
            .map(|i| {
                let record = sample_record("alice", None, (count - i) as i64);
                store.put(&record).unwrap();
                record.id
            })
            .collect()
    }

    async fn wait_for_in_flight(engine: &PhotoSyncEngine, count: usize) {
        for _ in 0..500 {
            if engine.in_flight_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("uploads never started");
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_successful_noop() {
        let f = fixture(Mode::Succeed);
        let result = f.engine.start_sync(SyncOptions::default()).await.unwrap();
        assert_eq!(result, SyncResult::empty());
        assert!(f.store.last_sync().unwrap().is_none());
        assert_eq!(f.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_uploads_pending_photos() {
        let f = fixture(Mode::Succeed);
        let ids = add_records(&f.store, 3);
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        let _sub = f.engine.progress().subscribe(move |event| {
            if event.phase == UploadPhase::Complete {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let result = f.engine.start_sync(SyncOptions::default()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.synced_count, 3);
        assert_eq!(completed.load(Ordering::SeqCst), 3);

        for id in ids {
            let record = f.store.get(&id).unwrap().unwrap();
            assert_eq!(record.sync_status, SyncStatus::Synced);
            assert_eq!(record.upload_key, Some(format!("photos/{}", record.filename())));
            assert!(record.upload_url.is_some());
        }
        assert!(f.store.last_sync().unwrap().is_some());
        assert_eq!(*f.engine.progress().overall().borrow(), (3, 3));
        assert!(!f.engine.is_syncing());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let f = fixture(Mode::Succeed);
        add_records(&f.store, 7);

        let result = f.engine.start_sync(SyncOptions::default()).await.unwrap();
        assert_eq!(result.synced_count, 7);
        assert!(f.gateway.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_retries_until_failed() {
        let f = fixture_with(
            FakeGateway::new(Mode::Fail),
            SyncConfig {
                max_retries: 2,
                ..test_config()
            },
        );
        let id = add_records(&f.store, 1)[0];

        let first = f.engine.start_sync(SyncOptions::default()).await.unwrap();
        assert!(!first.success);
        assert_eq!(first.failed_count, 1);
        assert_eq!(first.errors[0].record_id, id);
        let record = f.store.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.retry_count, 1);

        f.engine.start_sync(SyncOptions::default()).await.unwrap();
        let record = f.store.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Failed);
        assert_eq!(record.retry_count, 2);

        // Budget exhausted: the photo is no longer picked up automatically
        let third = f.engine.start_sync(SyncOptions::default()).await.unwrap();
        assert_eq!(third, SyncResult::empty());
        assert_eq!(f.gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_larger_budget_does_not_revive_failed_photo() {
        let f = fixture_with(
            FakeGateway::new(Mode::Fail),
            SyncConfig {
                max_retries: 1,
                ..test_config()
            },
        );
        let id = add_records(&f.store, 1)[0];
        f.engine.start_sync(SyncOptions::default()).await.unwrap();
        assert_eq!(f.store.get(&id).unwrap().unwrap().sync_status, SyncStatus::Failed);

        // Same store, restarted with the default budget of 3
        f.gateway.set_mode(Mode::Succeed);
        let restarted = PhotoSyncEngine::new(
            f.store.clone(),
            f.gateway.clone(),
            f.conditions.clone(),
            ProgressBus::new(),
            test_config(),
        );
        assert!(restarted.sync_if_needed().await.unwrap().is_none());

        let raised = restarted
            .start_sync(SyncOptions {
                max_retries: Some(5),
                ..SyncOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(raised, SyncResult::empty());

        let record = f.store.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert_eq!(f.gateway.calls(), 1);
    }

    #[tokio::test]
    async fn test_success_after_failure_clears_retry_count() {
        let f = fixture(Mode::Fail);
        let id = add_records(&f.store, 1)[0];

        f.engine.start_sync(SyncOptions::default()).await.unwrap();
        let record = f.store.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert!(record.sync_error.is_some());

        f.gateway.set_mode(Mode::Succeed);
        let result = f.engine.start_sync(SyncOptions::default()).await.unwrap();
        assert_eq!(result.synced_count, 1);

        let record = f.store.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.retry_count, 0);
        assert!(record.sync_error.is_none());
    }

    #[tokio::test]
    async fn test_retry_failed_uploads_resets_budget() {
        let f = fixture_with(
            FakeGateway::new(Mode::Fail),
            SyncConfig {
                max_retries: 1,
                ..test_config()
            },
        );
        let id = add_records(&f.store, 1)[0];
        f.engine.start_sync(SyncOptions::default()).await.unwrap();
        assert_eq!(f.engine.get_sync_status().unwrap().failed_count, 1);

        f.gateway.set_mode(Mode::Succeed);
        let result = f
            .engine
            .retry_failed_uploads(SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(result.synced_count, 1);

        let record = f.store.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.retry_count, 0);
        assert!(record.sync_error.is_none());
    }

    #[tokio::test]
    async fn test_preconditions() {
        let f = fixture(Mode::Succeed);
        add_records(&f.store, 1);

        f.conditions.set(DeviceConditions::offline());
        assert!(matches!(
            f.engine.start_sync(SyncOptions::default()).await,
            Err(SyncError::Offline)
        ));

        f.conditions.set(DeviceConditions {
            is_unmetered: false,
            ..DeviceConditions::default()
        });
        let wifi_only = SyncOptions {
            wifi_only: Some(true),
            ..SyncOptions::default()
        };
        assert!(matches!(
            f.engine.start_sync(wifi_only).await,
            Err(SyncError::WifiRequired)
        ));

        assert_eq!(f.gateway.calls(), 0);
        assert!(!f.engine.is_syncing());
        assert_eq!(f.engine.get_sync_status().unwrap().pending_count, 1);
    }

    #[tokio::test]
    async fn test_second_pass_is_rejected_and_cancel_restores_status() {
        let f = fixture(Mode::Hang);
        let ids = add_records(&f.store, 2);

        let engine = f.engine.clone();
        let pass = tokio::spawn(async move { engine.start_sync(SyncOptions::default()).await });
        wait_for_in_flight(&f.engine, 2).await;

        assert!(f.engine.get_sync_status().unwrap().in_progress);
        assert!(matches!(
            f.engine.start_sync(SyncOptions::default()).await,
            Err(SyncError::AlreadyInProgress)
        ));
        // Forcing a second pass finds nothing: both photos are in flight
        let forced = f
            .engine
            .start_sync(SyncOptions {
                force: true,
                ..SyncOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(forced, SyncResult::empty());

        assert_eq!(f.engine.cancel_all_uploads(), 2);
        let result = pass.await.unwrap().unwrap();
        assert_eq!(result.synced_count, 0);
        assert_eq!(result.failed_count, 0);

        for id in ids {
            let record = f.store.get(&id).unwrap().unwrap();
            assert_eq!(record.sync_status, SyncStatus::Pending);
            assert_eq!(record.retry_count, 0);
        }
        assert!(!f.engine.is_syncing());
        assert_eq!(f.engine.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_single_upload() {
        let f = fixture_with(
            FakeGateway::new(Mode::Hang),
            SyncConfig {
                max_concurrent: 1,
                ..test_config()
            },
        );
        let id = add_records(&f.store, 1)[0];
        assert!(!f.engine.cancel_upload(&id));

        let engine = f.engine.clone();
        let pass = tokio::spawn(async move { engine.start_sync(SyncOptions::default()).await });
        wait_for_in_flight(&f.engine, 1).await;

        assert!(f.engine.cancel_upload(&id));
        let result = pass.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(f.store.get(&id).unwrap().unwrap().sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_slot_claims_nothing_more() {
        let f = fixture_with(
            FakeGateway::new(Mode::Hang),
            SyncConfig {
                max_concurrent: 1,
                ..test_config()
            },
        );
        let ids = add_records(&f.store, 2);
        let preparing = Arc::new(AtomicUsize::new(0));
        let counter = preparing.clone();
        let _sub = f.engine.progress().subscribe(move |event| {
            if event.phase == UploadPhase::Preparing {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let engine = f.engine.clone();
        let pass = tokio::spawn(async move { engine.start_sync(SyncOptions::default()).await });
        wait_for_in_flight(&f.engine, 1).await;

        assert_eq!(f.engine.cancel_all_uploads(), 1);
        let result = pass.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.failed_count, 0);

        assert_eq!(preparing.load(Ordering::SeqCst), 1);
        let untouched = f.store.get(&ids[1]).unwrap().unwrap();
        assert_eq!(untouched.sync_status, SyncStatus::Pending);
        assert!(untouched.last_sync_attempt.is_none());
    }

    #[tokio::test]
    async fn test_photo_deleted_during_upload_is_not_a_failure() {
        let f = fixture_with(
            FakeGateway::new(Mode::Hang),
            SyncConfig {
                network_timeout_ms: 200,
                ..test_config()
            },
        );
        let id = add_records(&f.store, 1)[0];

        let engine = f.engine.clone();
        let pass = tokio::spawn(async move { engine.start_sync(SyncOptions::default()).await });
        wait_for_in_flight(&f.engine, 1).await;

        f.store.delete(&id).unwrap();
        let result = pass.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.failed_count, 0);
        assert!(result.errors.is_empty());
        assert!(f.store.get(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let f = fixture_with(
            FakeGateway::new(Mode::Hang),
            SyncConfig {
                network_timeout_ms: 20,
                ..test_config()
            },
        );
        let id = add_records(&f.store, 1)[0];

        let result = f.engine.start_sync(SyncOptions::default()).await.unwrap();
        assert_eq!(result.failed_count, 1);
        assert!(result.errors[0].error.contains("timed out"));

        let record = f.store.get(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn test_data_saver_stops_remaining_batches() {
        let store = Arc::new(PhotoStore::open_in_memory(StoreConfig::default()).unwrap());
        let conditions = Arc::new(FixedConditions::default());
        let mut gateway = FakeGateway::new(Mode::Succeed);
        gateway.flip_after_first = Some(conditions.clone());
        let engine = PhotoSyncEngine::new(
            store.clone(),
            Arc::new(gateway),
            conditions,
            ProgressBus::new(),
            SyncConfig {
                batch_size: 1,
                ..test_config()
            },
        );
        let ids = add_records(&store, 3);

        let result = engine.start_sync(SyncOptions::default()).await.unwrap();
        assert_eq!(result.synced_count, 1);
        assert!(result.success);

        assert_eq!(store.get(&ids[0]).unwrap().unwrap().sync_status, SyncStatus::Synced);
        assert_eq!(store.get(&ids[1]).unwrap().unwrap().sync_status, SyncStatus::Pending);
        assert_eq!(store.get(&ids[2]).unwrap().unwrap().sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_sync_if_needed() {
        let f = fixture(Mode::Succeed);
        assert!(f.engine.sync_if_needed().await.unwrap().is_none());

        add_records(&f.store, 2);
        f.conditions.set(DeviceConditions {
            network_quality: crate::conditions::NetworkQuality::Poor,
            battery_level: 0.1,
            ..DeviceConditions::default()
        });
        assert!(f.engine.sync_if_needed().await.unwrap().is_none());

        f.conditions.set(DeviceConditions::default());
        let result = f.engine.sync_if_needed().await.unwrap().unwrap();
        assert_eq!(result.synced_count, 2);
    }
}
