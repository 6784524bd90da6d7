//! Device state registry
//!
//! Owns the authoritative in-memory table of smart-home devices, mirrors
//! every mutation to durable storage, and publishes state-change events
//! that the automation engine and transport relays consume.

pub mod device;
pub mod error;
pub mod event;
pub mod persistence;
pub mod registry;
pub mod store;

pub use device::{
    Actor, Device, DeviceCommand, DeviceFilter, DeviceSpec, DeviceUpdate, HistoryEntry,
    RegistryStatistics, StateMap,
};
pub use error::RegistryError;
pub use event::DeviceEvent;
pub use registry::DeviceRegistry;
pub use store::{DeviceStore, MemoryDeviceStore, StoreError};
