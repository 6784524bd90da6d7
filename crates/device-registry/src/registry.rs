//! The device registry
//!
//! Authoritative in-memory device table with a secondary address index.
//! Every mutation is persisted through the store before the table is
//! updated and the corresponding event is published. State updates for a
//! single device are serialized through a per-device lane so that each
//! published `StateChanged` carries an `old_state` equal to the previous
//! change's `new_state`.

use crate::device::{
    Actor, Device, DeviceCommand, DeviceFilter, DeviceSpec, DeviceUpdate, HistoryEntry,
    RegistryStatistics, StateMap,
};
use crate::error::RegistryError;
use crate::event::DeviceEvent;
use crate::store::DeviceStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Registry event channel capacity
const EVENT_CAPACITY: usize = 256;

/// The device state registry
pub struct DeviceRegistry {
    /// Authoritative device table
    devices: DashMap<String, Device>,
    /// Secondary index: physical address -> device id
    address_index: DashMap<String, String>,
    /// Per-device update lanes; a lane serializes state mutations for one id
    lanes: DashMap<String, Arc<Mutex<()>>>,
    /// Durable mirror
    store: Arc<dyn DeviceStore>,
    /// Event broadcaster
    event_tx: broadcast::Sender<DeviceEvent>,
}

impl DeviceRegistry {
    /// Create a registry, loading previously persisted devices.
    pub async fn new(store: Arc<dyn DeviceStore>) -> Result<Self, RegistryError> {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let devices = DashMap::new();
        let address_index = DashMap::new();
        for device in store.load_devices().await? {
            if let Some(address) = &device.address {
                address_index.insert(address.clone(), device.id.clone());
            }
            devices.insert(device.id.clone(), device);
        }

        Ok(Self {
            devices,
            address_index,
            lanes: DashMap::new(),
            store,
            event_tx,
        })
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_tx.subscribe()
    }

    /// Register a new device with empty state.
    pub async fn register(&self, spec: DeviceSpec) -> Result<Device, RegistryError> {
        validate_spec(&spec)?;

        if let Some(address) = &spec.address {
            if self.address_index.contains_key(address) {
                return Err(RegistryError::AddressInUse(address.clone()));
            }
        }

        let now = Utc::now();
        let device = Device {
            id: uuid::Uuid::new_v4().to_string(),
            address: spec.address,
            name: spec.name,
            device_type: spec.device_type,
            protocol: spec.protocol,
            manufacturer: spec.manufacturer,
            model: spec.model,
            firmware: spec.firmware,
            room: spec.room,
            state: StateMap::new(),
            capabilities: spec.capabilities,
            metadata: spec.metadata,
            online: true,
            created_at: now,
            updated_at: now,
            last_seen: Some(now),
        };

        self.store.put_device(&device).await?;
        if let Some(address) = &device.address {
            self.address_index.insert(address.clone(), device.id.clone());
        }
        self.devices.insert(device.id.clone(), device.clone());

        let _ = self.event_tx.send(DeviceEvent::Registered(device.clone()));
        tracing::info!("Registered device: {} ({})", device.name, device.id);
        Ok(device)
    }

    /// Get a device by id
    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices.get(id).map(|r| r.value().clone())
    }

    /// Get a device by physical address
    pub fn get_by_address(&self, address: &str) -> Option<Device> {
        let id = self.address_index.get(address)?.value().clone();
        self.get(&id)
    }

    /// List devices matching the filter; the returned devices are copies.
    pub fn list(&self, filter: &DeviceFilter) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Merge a partial state into a device's state.
    ///
    /// This is the sole producer of `StateChanged` events. Calls for the
    /// same device are applied in issue order; the device is marked online
    /// and a history snapshot is appended.
    pub async fn update_state(
        &self,
        id: &str,
        partial: StateMap,
        actor: Actor,
    ) -> Result<StateMap, RegistryError> {
        let lane = self.lane(id);
        let _guard = lane.lock().await;

        let mut device = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let old_state = device.state.clone();
        device.merge_state(&partial);
        let new_state = device.state.clone();

        let now = Utc::now();
        device.online = true;
        device.last_seen = Some(now);
        device.updated_at = now;

        self.store.put_device(&device).await?;
        self.store
            .append_history(&HistoryEntry {
                device_id: id.to_string(),
                state: new_state.clone(),
                actor: actor.clone(),
                recorded_at: now,
            })
            .await?;

        self.devices.insert(id.to_string(), device);

        let _ = self.event_tx.send(DeviceEvent::StateChanged {
            device_id: id.to_string(),
            old_state,
            new_state: new_state.clone(),
            actor,
        });

        Ok(new_state)
    }

    /// Update descriptive fields.
    pub async fn update_info(&self, id: &str, patch: DeviceUpdate) -> Result<Device, RegistryError> {
        let lane = self.lane(id);
        let _guard = lane.lock().await;

        let mut device = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let old_address = device.address.clone();

        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(RegistryError::Validation("name must not be blank".into()));
            }
            device.name = name;
        }
        if let Some(address) = patch.address {
            if let Some(new_address) = &address {
                let taken = self
                    .address_index
                    .get(new_address)
                    .is_some_and(|owner| owner.value().as_str() != id);
                if taken {
                    return Err(RegistryError::AddressInUse(new_address.clone()));
                }
            }
            device.address = address;
        }
        if let Some(manufacturer) = patch.manufacturer {
            device.manufacturer = manufacturer;
        }
        if let Some(model) = patch.model {
            device.model = model;
        }
        if let Some(firmware) = patch.firmware {
            device.firmware = firmware;
        }
        if let Some(room) = patch.room {
            device.room = room;
        }
        if let Some(capabilities) = patch.capabilities {
            device.capabilities = capabilities;
        }
        if let Some(metadata) = patch.metadata {
            device.metadata = metadata;
        }
        device.updated_at = Utc::now();

        self.store.put_device(&device).await?;

        if device.address != old_address {
            if let Some(old) = &old_address {
                self.address_index.remove(old);
            }
            if let Some(new) = &device.address {
                self.address_index.insert(new.clone(), id.to_string());
            }
        }
        self.devices.insert(id.to_string(), device.clone());

        let _ = self.event_tx.send(DeviceEvent::InfoUpdated(device.clone()));
        Ok(device)
    }

    /// Delete a device; its history is cascaded away with it.
    pub async fn delete(&self, id: &str) -> Result<Device, RegistryError> {
        let device = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        self.store.delete_device(id).await?;

        self.devices.remove(id);
        if let Some(address) = &device.address {
            self.address_index.remove(address);
        }
        self.lanes.remove(id);

        let _ = self.event_tx.send(DeviceEvent::Deleted {
            device_id: id.to_string(),
        });
        tracing::info!("Deleted device: {} ({})", device.name, id);
        Ok(device)
    }

    /// Mark a device reachable. Unknown ids are a silent no-op so that
    /// stale adapter notifications cannot crash the registry.
    pub async fn mark_online(&self, id: &str) -> Result<(), RegistryError> {
        self.mark_reachability(id, true).await
    }

    /// Mark a device unreachable. Unknown ids are a silent no-op.
    pub async fn mark_offline(&self, id: &str) -> Result<(), RegistryError> {
        self.mark_reachability(id, false).await
    }

    async fn mark_reachability(&self, id: &str, online: bool) -> Result<(), RegistryError> {
        let lane = self.lane(id);
        let _guard = lane.lock().await;

        let Some(mut device) = self.get(id) else {
            tracing::debug!("Ignoring reachability update for unknown device {}", id);
            return Ok(());
        };
        if device.online == online {
            return Ok(());
        }

        let now = Utc::now();
        device.online = online;
        device.updated_at = now;
        if online {
            device.last_seen = Some(now);
        }

        self.store.put_device(&device).await?;
        self.devices.insert(id.to_string(), device);

        let event = if online {
            DeviceEvent::Online {
                device_id: id.to_string(),
            }
        } else {
            DeviceEvent::Offline {
                device_id: id.to_string(),
            }
        };
        let _ = self.event_tx.send(event);
        Ok(())
    }

    /// Issue a command toward a device.
    ///
    /// Publishes a `Control` event for the protocol adapter (which is
    /// solely responsible for effecting it on the physical network), then
    /// optimistically merges the state the command implies.
    pub async fn control(
        &self,
        id: &str,
        command: DeviceCommand,
        actor: Actor,
    ) -> Result<(), RegistryError> {
        let device = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let _ = self.event_tx.send(DeviceEvent::Control {
            device_id: id.to_string(),
            command: command.clone(),
        });

        let patch = command_state_patch(&command, &device.state);
        if !patch.is_empty() {
            self.update_state(id, patch, actor).await?;
        }
        Ok(())
    }

    /// Full state history of a device, oldest first.
    pub async fn history(
        &self,
        id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>, RegistryError> {
        if !self.devices.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(self.store.history(id, limit).await?)
    }

    /// Retention cleanup: drop history rows older than the cutoff.
    pub async fn prune_history(&self, before: DateTime<Utc>) -> Result<usize, RegistryError> {
        let removed = self.store.prune_history(before).await?;
        if removed > 0 {
            tracing::info!("Pruned {} history rows older than {}", removed, before);
        }
        Ok(removed)
    }

    /// Aggregate counters, computed by full scan. Device counts are small
    /// (hundreds, not millions), so a scan is fine.
    pub fn statistics(&self) -> RegistryStatistics {
        let mut by_protocol: HashMap<String, usize> = HashMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut online = 0;
        let mut total = 0;

        for entry in self.devices.iter() {
            let device = entry.value();
            total += 1;
            if device.online {
                online += 1;
            }
            *by_protocol.entry(device.protocol.clone()).or_default() += 1;
            *by_type.entry(device.device_type.clone()).or_default() += 1;
        }

        RegistryStatistics {
            total,
            online,
            offline: total - online,
            by_protocol,
            by_type,
        }
    }

    fn lane(&self, id: &str) -> Arc<Mutex<()>> {
        self.lanes
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn validate_spec(spec: &DeviceSpec) -> Result<(), RegistryError> {
    for (field, value) in [
        ("name", &spec.name),
        ("device_type", &spec.device_type),
        ("protocol", &spec.protocol),
    ] {
        if value.trim().is_empty() {
            return Err(RegistryError::Validation(format!(
                "{field} must not be blank"
            )));
        }
    }
    Ok(())
}

/// Derive the optimistic state a command implies.
///
/// Unknown commands merge their parameters only; commands with no state
/// implication leave the device untouched until the adapter reports back.
fn command_state_patch(command: &DeviceCommand, current: &StateMap) -> StateMap {
    let mut patch = command.parameters.clone();
    match command.name.as_str() {
        "turn_on" => {
            patch.insert("on".to_string(), Value::Bool(true));
        }
        "turn_off" => {
            patch.insert("on".to_string(), Value::Bool(false));
        }
        "toggle" => {
            let on = current.get("on").and_then(Value::as_bool).unwrap_or(false);
            patch.insert("on".to_string(), Value::Bool(!on));
        }
        _ => {}
    }
    patch
}
