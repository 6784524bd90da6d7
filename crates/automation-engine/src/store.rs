//! Storage seam for automations and their execution journal

use crate::model::{Automation, ExecutionRecord};
use async_trait::async_trait;
use device_registry::StoreError;
use std::collections::HashMap;
use std::sync::RwLock;

/// Durable storage for automations and run records.
///
/// Deleting an automation cascades to its run records.
#[async_trait]
pub trait AutomationStore: Send + Sync {
    /// Insert or replace an automation row
    async fn put_automation(&self, automation: &Automation) -> Result<(), StoreError>;

    /// Delete an automation row and its run records
    async fn delete_automation(&self, automation_id: &str) -> Result<(), StoreError>;

    /// Load all automation rows
    async fn load_automations(&self) -> Result<Vec<Automation>, StoreError>;

    /// Append an immutable run record
    async fn append_run(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Run records for one automation, newest first, optionally capped
    async fn runs(
        &self,
        automation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;
}

#[derive(Default)]
struct Tables {
    automations: HashMap<String, Automation>,
    runs: Vec<ExecutionRecord>,
}

/// In-memory store, no durability
#[derive(Default)]
pub struct MemoryAutomationStore {
    tables: RwLock<Tables>,
}

impl MemoryAutomationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AutomationStore for MemoryAutomationStore {
    async fn put_automation(&self, automation: &Automation) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        tables
            .automations
            .insert(automation.id.clone(), automation.clone());
        Ok(())
    }

    async fn delete_automation(&self, automation_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        tables.automations.remove(automation_id);
        tables.runs.retain(|r| r.automation_id != automation_id);
        Ok(())
    }

    async fn load_automations(&self) -> Result<Vec<Automation>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
        Ok(tables.automations.values().cloned().collect())
    }

    async fn append_run(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| StoreError::Poisoned)?;
        tables.runs.push(record.clone());
        Ok(())
    }

    async fn runs(
        &self,
        automation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let tables = self.tables.read().map_err(|_| StoreError::Poisoned)?;
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
