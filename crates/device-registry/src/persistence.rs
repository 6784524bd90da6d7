//! JSON-file backed device store
//!
//! Rows are held in memory and mirrored to pretty-printed JSON files with
//! atomic tmp-file + rename writes, so a crash mid-write never corrupts
//! the previous snapshot.

use crate::device::{Device, HistoryEntry};
use crate::store::{DeviceStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    devices: HashMap<String, Device>,
    history: Vec<HistoryEntry>,
}

/// Device store mirrored to `devices.json` and `device_history.json`
pub struct JsonDeviceStore {
    devices_path: PathBuf,
    history_path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonDeviceStore {
    /// Open (or create) a store under the given data directory.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let devices_path = data_dir.join("devices.json");
        let history_path = data_dir.join("device_history.json");

        let devices: Vec<Device> = load_rows(&devices_path).await;
        let history: Vec<HistoryEntry> = load_rows(&history_path).await;
        tracing::info!(
            devices = devices.len(),
            history = history.len(),
            "Loaded device store from {:?}",
            data_dir
        );

        Ok(Self {
            devices_path,
            history_path,
            tables: Mutex::new(Tables {
                devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
                history,
            }),
        })
    }

    async fn save_devices(&self, tables: &Tables) -> Result<(), StoreError> {
        let rows: Vec<&Device> = tables.devices.values().collect();
        save_rows(&self.devices_path, &rows).await
    }

    async fn save_history(&self, tables: &Tables) -> Result<(), StoreError> {
        save_rows(&self.history_path, &tables.history).await
    }
}

#[async_trait]
impl DeviceStore for JsonDeviceStore {
    async fn put_device(&self, device: &Device) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.devices.insert(device.id.clone(), device.clone());
        self.save_devices(&tables).await
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.devices.remove(device_id);
        tables.history.retain(|entry| entry.device_id != device_id);
        self.save_devices(&tables).await?;
        self.save_history(&tables).await
    }

    async fn load_devices(&self) -> Result<Vec<Device>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.devices.values().cloned().collect())
    }

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.history.push(entry.clone());
        self.save_history(&tables).await
    }

    async fn history(
        &self,
        device_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let tables = self.tables.lock().await;
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
        let mut tables = self.tables.lock().await;
        let len_before = tables.history.len();
        tables.history.retain(|entry| entry.recorded_at >= before);
        let removed = len_before - tables.history.len();
        if removed > 0 {
            self.save_history(&tables).await?;
        }
        Ok(removed)
    }
}

/// Load rows from a JSON file, starting fresh if it is missing or unreadable
async fn load_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Vec<T> {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<Vec<T>>(&contents) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Failed to parse {:?}: {}", path, e);
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No file at {:?}, starting fresh", path);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("Failed to read {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// Write rows to a JSON file atomically: write to temp file, then rename
async fn save_rows<T: serde::Serialize>(path: &Path, rows: &[T]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_string_pretty(rows)?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}
