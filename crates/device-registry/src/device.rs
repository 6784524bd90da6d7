//! Device model and request/response types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Open property map holding a device's reported state.
pub type StateMap = serde_json::Map<String, serde_json::Value>;

/// A registered smart-home device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Opaque registry-assigned identifier, never reused
    pub id: String,
    /// Protocol-specific physical address (e.g. a hardware address),
    /// unique across live devices when present
    #[serde(default)]
    pub address: Option<String>,
    /// User-facing name
    pub name: String,
    /// Device kind (e.g. "light", "sensor")
    pub device_type: String,
    /// Transport protocol (e.g. "zigbee", "matter", "mqtt")
    pub protocol: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    /// Reported state, merged key-by-key on update
    #[serde(default)]
    pub state: StateMap,
    /// Ability tags (e.g. "on_off", "brightness")
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: StateMap,
    pub online: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    /// Merge a partial state into the current state, last write wins per key.
    pub fn merge_state(&mut self, partial: &StateMap) {
        for (key, value) in partial {
            self.state.insert(key.clone(), value.clone());
        }
    }
}

/// Who caused a device mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    /// A user acting through the API
    User { id: String },
    /// An automation run
    Automation { id: String },
    /// The protocol adapter itself (no user-visible actor)
    Protocol,
}

/// Registration payload for a new device
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub device_type: String,
    pub protocol: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: StateMap,
}

/// Partial update of a device's descriptive fields
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<Option<String>>,
    #[serde(default)]
    pub manufacturer: Option<Option<String>>,
    #[serde(default)]
    pub model: Option<Option<String>>,
    #[serde(default)]
    pub firmware: Option<Option<String>>,
    #[serde(default)]
    pub room: Option<Option<String>>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<StateMap>,
}

/// Filter predicate for device listings; fields are conjunctive
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceFilter {
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub online: Option<bool>,
}

impl DeviceFilter {
    #[must_use]
    pub fn matches(&self, device: &Device) -> bool {
        if let Some(protocol) = &self.protocol {
            if device.protocol != *protocol {
                return false;
            }
        }
        if let Some(device_type) = &self.device_type {
            if device.device_type != *device_type {
                return false;
            }
        }
        if let Some(room) = &self.room {
            if device.room.as_deref() != Some(room.as_str()) {
                return false;
            }
        }
        if let Some(online) = self.online {
            if device.online != online {
                return false;
            }
        }
        true
    }
}

/// A command destined for the protocol adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCommand {
    /// Command name (e.g. "turn_on", "set")
    pub name: String,
    #[serde(default)]
    pub parameters: StateMap,
}

/// Immutable record of a device's state after a change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub device_id: String,
    /// Full resulting state snapshot, not a diff
    pub state: StateMap,
    pub actor: Actor,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate registry counters, computed by full scan
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub by_protocol: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
}
