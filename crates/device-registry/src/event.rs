//! Registry event types

use crate::device::{Actor, Device, DeviceCommand, StateMap};

/// Events published by the registry.
///
/// Consumers: the automation engine (state triggers), protocol adapters
/// (`Control`), and the WebSocket relay (everything).
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A new device was registered
    Registered(Device),
    /// A device's state changed; `old_state` is exactly the `new_state`
    /// of the immediately preceding change for the same device
    StateChanged {
        device_id: String,
        old_state: StateMap,
        new_state: StateMap,
        actor: Actor,
    },
    /// Descriptive fields were updated
    InfoUpdated(Device),
    /// A device was deleted
    Deleted { device_id: String },
    /// A device was marked reachable
    Online { device_id: String },
    /// A device was marked unreachable
    Offline { device_id: String },
    /// A command for the protocol adapter to effect on the physical network
    Control {
        device_id: String,
        command: DeviceCommand,
    },
}
