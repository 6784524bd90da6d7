//! JSON-file backed automation store
//!
//! Same mirror strategy as the device store: rows in memory, atomic
//! tmp-file + rename writes to `automations.json` and `automation_runs.json`.

use crate::model::{Automation, ExecutionRecord};
use crate::store::AutomationStore;
use async_trait::async_trait;
use device_registry::StoreError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    automations: HashMap<String, Automation>,
    runs: Vec<ExecutionRecord>,
}

/// Automation store mirrored to JSON files under a data directory
pub struct JsonAutomationStore {
    automations_path: PathBuf,
    runs_path: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonAutomationStore {
    /// Open (or create) a store under the given data directory.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let automations_path = data_dir.join("automations.json");
        let runs_path = data_dir.join("automation_runs.json");

        let automations: Vec<Automation> = load_rows(&automations_path).await;
        let runs: Vec<ExecutionRecord> = load_rows(&runs_path).await;
        tracing::info!(
            automations = automations.len(),
            runs = runs.len(),
            "Loaded automation store from {:?}",
            data_dir
        );

        Ok(Self {
            automations_path,
            runs_path,
            tables: Mutex::new(Tables {
                automations: automations.into_iter().map(|a| (a.id.clone(), a)).collect(),
                runs,
            }),
        })
    }

    async fn save_automations(&self, tables: &Tables) -> Result<(), StoreError> {
        let rows: Vec<&Automation> = tables.automations.values().collect();
        save_rows(&self.automations_path, &rows).await
    }

    async fn save_runs(&self, tables: &Tables) -> Result<(), StoreError> {
        save_rows(&self.runs_path, &tables.runs).await
    }
}

#[async_trait]
impl AutomationStore for JsonAutomationStore {
    async fn put_automation(&self, automation: &Automation) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .automations
            .insert(automation.id.clone(), automation.clone());
        self.save_automations(&tables).await
    }

    async fn delete_automation(&self, automation_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.automations.remove(automation_id);
        tables.runs.retain(|r| r.automation_id != automation_id);
        self.save_automations(&tables).await?;
        self.save_runs(&tables).await
    }

    async fn load_automations(&self) -> Result<Vec<Automation>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.automations.values().cloned().collect())
    }

    async fn append_run(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.runs.push(record.clone());
        self.save_runs(&tables).await
    }

    async fn runs(
        &self,
        automation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<ExecutionRecord> = tables
            .runs
            .iter()
            .filter(|r| r.automation_id == automation_id)
            .cloned()
            .collect();
        rows.reverse();
        if let Some(n) = limit {
            rows.truncate(n);
        }
        Ok(rows)
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
