//! Storage seam for devices and their history
//!
//! The registry mirrors every mutation through a [`DeviceStore`]. The
//! in-memory implementation backs tests and embedders that do not need
//! durability; [`crate::persistence::JsonDeviceStore`] adds a JSON-file
//! mirror on top of the same semantics.

use crate::device::{Device, HistoryEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Storage failures, surfaced to callers as `RegistryError::Storage`
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Durable, key-addressed storage for devices and history rows.
///
/// Deleting a device cascades to its history.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Insert or replace a device row
    async fn put_device(&self, device: &Device) -> Result<(), StoreError>;

    /// Delete a device row and every history row that references it
    async fn delete_device(&self, device_id: &str) -> Result<(), StoreError>;

    /// Load all device rows
    async fn load_devices(&self) -> Result<Vec<Device>, StoreError>;

    /// Append an immutable history row
    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError>;

    /// History rows for one device, oldest first, optionally capped to the
    /// most recent `limit` rows
    async fn history(
        &self,
        device_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Delete history rows older than the cutoff; returns how many were removed
    async fn prune_history(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct Tables {
    devices: HashMap<String, Device>,
    history: Vec<HistoryEntry>,
}

/// In-memory store, no durability
#[derive(Default)]
pub struct MemoryDeviceStore {
    tables: RwLock<Tables>,
}

impl MemoryDeviceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn put_device(&self, device: &Device) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        tables.devices.insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        tables.devices.remove(device_id);
        tables.history.retain(|entry| entry.device_id != device_id);
        Ok(())
    }

    async fn load_devices(&self) -> Result<Vec<Device>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.devices.values().cloned().collect())
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        tables.history.push(entry.clone());
        Ok(())
    }

    async fn history(
        &self,
        device_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        let rows: Vec<HistoryEntry> = tables
            .history
            .iter()
            .filter(|entry| entry.device_id == device_id)
            .cloned()
            .collect();
        Ok(match limit {
            Some(n) if rows.len() > n => rows[rows.len() - n..].to_vec(),
            _ => rows,
        })
    }

    async fn prune_history(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        let len_before = tables.history.len();
        tables.history.retain(|entry| entry.recorded_at >= before);
        Ok(len_before - tables.history.len())
    }
}
