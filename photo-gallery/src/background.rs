use crate::conditions::DeviceConditions;
use crate::scheduler::PhotoSyncEngine;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const SYNC_LOG_CAP: usize = 500;

/// In-memory record of one background pass (lost on restart)
#[derive(Debug, Clone, PartialEq)]
pub struct SyncLogEntry {
    pub at: DateTime<Utc>,
    pub synced: usize,
    pub failed: usize,
}

type SyncLog = Arc<Mutex<Vec<SyncLogEntry>>>;

fn append_log(log: &SyncLog, entry: SyncLogEntry) {
    if let Ok(mut guard) = log.lock() {
        guard.push(entry);
        let len = guard.len();
        if len > SYNC_LOG_CAP {
            guard.drain(0..len - SYNC_LOG_CAP);
        }
    }
}

enum Wake {
    Stop,
    Tick,
    Connectivity(Option<bool>),
}

/// Resolves with the new online state on every change; never resolves without a channel.
async fn next_online_state(changes: &mut Option<watch::Receiver<DeviceConditions>>) -> Option<bool> {
    match changes {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().is_online),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// Handle of the background sync loop.
///
/// The loop runs [`PhotoSyncEngine::sync_if_needed`] on every timer tick and
/// whenever the device comes back online. Dropping the handle stops the loop
/// after the running pass has wound down.
pub struct BackgroundSync {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
    log: SyncLog,
}

impl BackgroundSync {
    pub fn spawn(engine: Arc<PhotoSyncEngine>, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let log: SyncLog = Arc::new(Mutex::new(Vec::new()));

        log::info!(
            "Starting background sync with {} second interval",
            interval.as_secs()
        );
        let handle = tokio::spawn(run_loop(engine, interval, stop.clone(), log.clone()));

        Self {
            stop,
            handle: Some(handle),
            log,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
            && self
                .handle
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false)
    }

    pub fn sync_log(&self) -> Vec<SyncLogEntry> {
        self.log.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    /// Stops the loop, cancelling in-flight uploads, and waits for it to exit.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("Background sync task failed: {}", e);
            }
        }
    }
}

impl Drop for BackgroundSync {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_loop(
    engine: Arc<PhotoSyncEngine>,
    interval: Duration,
    stop: CancellationToken,
    sync_log: SyncLog,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut changes = engine.conditions_changes();
    let mut was_online = changes
        .as_ref()
        .map(|rx| rx.borrow().is_online)
        .unwrap_or(true);

    loop {
        let wake = tokio::select! {
            _ = stop.cancelled() => Wake::Stop,
            _ = ticker.tick() => Wake::Tick,
            state = next_online_state(&mut changes) => Wake::Connectivity(state),
        };

        match wake {
            Wake::Stop => break,
            Wake::Tick => {}
            Wake::Connectivity(None) => {
                log::debug!("Conditions channel closed, relying on the timer");
                changes = None;
                continue;
            }
            Wake::Connectivity(Some(online)) => {
                let reconnected = online && !was_online;
                was_online = online;
                if !reconnected {
                    continue;
                }
                log::info!("Device back online, syncing");
            }
        }

        let pass = engine.sync_if_needed();
        tokio::pin!(pass);
        let finished = tokio::select! {
            outcome = &mut pass => Some(outcome),
            _ = stop.cancelled() => None,
        };
        let outcome = match finished {
            Some(outcome) => outcome,
            None => {
                engine.cancel_all_uploads();
                pass.await
            }
        };

        match outcome {
            Ok(Some(result)) => {
                log::info!(
                    "Background sync completed: {} synced, {} failed",
                    result.synced_count,
                    result.failed_count
                );
                append_log(
                    &sync_log,
                    SyncLogEntry {
                        at: Utc::now(),
                        synced: result.synced_count,
                        failed: result.failed_count,
                    },
                );
            }
            Ok(None) => {}
            Err(e) => log::warn!("Background sync error: {}", e),
        }
    }

    log::info!("Background sync stopped");
}
