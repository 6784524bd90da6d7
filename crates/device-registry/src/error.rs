//! Error types for the device registry

use crate::store::StoreError;
use thiserror::Error;

/// Errors raised by registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Device not found
    #[error("device not found: {0}")]
    NotFound(String),

    /// Malformed registration or update payload
    #[error("invalid device spec: {0}")]
    Validation(String),

    /// Physical address already belongs to a live device
    #[error("address already registered: {0}")]
    AddressInUse(String),

    /// Persistence failure
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}
