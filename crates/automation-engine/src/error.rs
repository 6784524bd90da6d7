//! Error types for the automation engine

use device_registry::StoreError;
use thiserror::Error;

/// Errors that can occur in the automation engine
#[derive(Error, Debug)]
pub enum AutomationError {
    /// Automation not found
    #[error("automation not found: {0}")]
    NotFound(String),

    /// Invalid trigger configuration
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Invalid cron expression
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid time format
    #[error("invalid time format: {0}")]
    InvalidTimeFormat(String),

    /// The AI collaborator produced unusable output
    #[error("generation failed: {0}")]
    Generation(String),

    /// A device-control action could not be issued
    #[error("device control failed: {0}")]
    DeviceControlFailed(String),

    /// Persistence failure
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl AutomationError {
    /// Whether this error is a malformed-input class error
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTrigger(_) | Self::InvalidCron(_) | Self::InvalidTimeFormat(_)
        )
    }
}
