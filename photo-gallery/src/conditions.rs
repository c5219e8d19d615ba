//! Device and network conditions that gate sync passes
//!
//! Battery and connection signals are platform hints rather than hard facts,
//! so the thresholds here are heuristics that may need per-platform tuning.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// Battery level at or below which a poor connection defers syncing
pub const DEFAULT_MIN_BATTERY_LEVEL: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Good,
    Fair,
    Poor,
}

/// Inputs of [`should_sync`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConditions {
    pub is_online: bool,
    pub network_quality: NetworkQuality,
    /// `0.0..=1.0`
    pub battery_level: f32,
    pub is_charging: bool,
    pub pending_count: usize,
}

/// Snapshot reported by a [`ConditionsProvider`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceConditions {
    pub is_online: bool,
    pub network_quality: NetworkQuality,
    pub battery_level: f32,
    pub is_charging: bool,
    /// Wi-Fi or ethernet rather than a metered mobile connection
    pub is_unmetered: bool,
    pub data_saver: bool,
}

impl Default for DeviceConditions {
    fn default() -> Self {
        Self {
            is_online: true,
            network_quality: NetworkQuality::Good,
            battery_level: 1.0,
            is_charging: false,
            is_unmetered: true,
            data_saver: false,
        }
    }
}

impl DeviceConditions {
    pub fn offline() -> Self {
        Self {
            is_online: false,
            ..Self::default()
        }
    }

    pub fn with_pending(&self, pending_count: usize) -> SyncConditions {
        SyncConditions {
            is_online: self.is_online,
            network_quality: self.network_quality,
            battery_level: self.battery_level,
            is_charging: self.is_charging,
            pending_count,
        }
    }
}

/// Decides whether a sync pass is worth starting, using the default battery threshold.
pub fn should_sync(conditions: &SyncConditions) -> bool {
    should_sync_with(conditions, DEFAULT_MIN_BATTERY_LEVEL)
}

/// [`should_sync`] with a configurable battery threshold.
///
/// Never syncs offline or without pending work. Charging always allows a
/// pass; otherwise only a poor connection on a low battery defers it.
pub fn should_sync_with(conditions: &SyncConditions, min_battery_level: f32) -> bool {
    if !conditions.is_online || conditions.pending_count == 0 {
        return false;
    }
    if conditions.is_charging {
        return true;
    }
    !(conditions.network_quality == NetworkQuality::Poor
        && conditions.battery_level <= min_battery_level)
}

/// Lighter check evaluated between batches of a running pass
pub fn should_continue(conditions: &DeviceConditions) -> bool {
    conditions.is_online && !conditions.data_saver
}

/// Maps the round-trip time of a probe request to a quality class
pub fn classify_latency(latency: Duration) -> NetworkQuality {
    if latency < Duration::from_secs(1) {
        NetworkQuality::Good
    } else if latency < Duration::from_secs(3) {
        NetworkQuality::Fair
    } else {
        NetworkQuality::Poor
    }
}

/// Source of device conditions for the sync engine
#[async_trait]
pub trait ConditionsProvider: Send + Sync {
    async fn current(&self) -> DeviceConditions;

    /// Change notifications, if the platform can push them
    fn changes(&self) -> Option<watch::Receiver<DeviceConditions>> {
        None
    }
}

/// Conditions set by the embedding application (or a test)
pub struct FixedConditions {
    tx: watch::Sender<DeviceConditions>,
}

impl FixedConditions {
    pub fn new(conditions: DeviceConditions) -> Self {
        let (tx, _) = watch::channel(conditions);
        Self { tx }
    }

    /// Replaces the conditions and notifies change subscribers
    pub fn set(&self, conditions: DeviceConditions) {
        self.tx.send_replace(conditions);
    }
}

impl Default for FixedConditions {
    fn default() -> Self {
        Self::new(DeviceConditions::default())
    }
}

#[async_trait]
impl ConditionsProvider for FixedConditions {
    async fn current(&self) -> DeviceConditions {
        *self.tx.borrow()
    }

    fn changes(&self) -> Option<watch::Receiver<DeviceConditions>> {
        Some(self.tx.subscribe())
    }
}
