//! Device registry store
//!
//! The registry maps device ids to [`DeviceEntry`]s. It is shared by the
//! device and consumer managers; every mutation happens from control-plane
//! operations and no lock is held across a suspension point.

use std::collections::HashMap;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::entry::{DeviceEntry, DeviceState};
use super::key::DeviceId;

/// Central registry of device pipelines
///
/// Thread-safe via `RwLock`. Read-heavy paths (stats, health checks) share
/// the lock; lifecycle operations take it exclusively for short, synchronous
/// critical sections.
#[derive(Debug, Default)]
pub struct Registry {
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access to all entries
    pub async fn read(&self) -> RwLockReadGuard<'_, HashMap<DeviceId, DeviceEntry>> {
        self.devices.read().await
    }

    /// Exclusive access to all entries
    pub async fn write(&self) -> RwLockWriteGuard<'_, HashMap<DeviceId, DeviceEntry>> {
        self.devices.write().await
    }

    /// Whether an entry exists (in any state)
    pub async fn contains(&self, device: &DeviceId) -> bool {
        self.devices.read().await.contains_key(device)
    }

    /// Lifecycle state of a device, `None` if absent
    pub async fn state(&self, device: &DeviceId) -> Option<DeviceState> {
        self.devices.read().await.get(device).map(|entry| entry.state)
    }

    /// Ids of all devices in the registry
    pub async fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of devices in the registry
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }
}
