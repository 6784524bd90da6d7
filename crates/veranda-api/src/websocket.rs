//! WebSocket relay for registry and engine events
//!
//! Purely a consumer: every public event is serialized as tagged JSON and
//! fanned out to connected clients.

use axum::extract::ws::{Message, WebSocket};
use device_registry::{DeviceCommand, DeviceEvent};
use futures::{SinkExt, StreamExt};
use serde::Serialize;

use automation_engine::engine::AutomationEvent;
use automation_engine::RunOutcome;

use crate::AppState;

/// Events sent to WebSocket clients
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    Connected,
    DeviceRegistered {
        device: device_registry::Device,
    },
    DeviceStateChanged {
        device_id: String,
        old_state: device_registry::StateMap,
        new_state: device_registry::StateMap,
    },
    DeviceInfoUpdated {
        device: device_registry::Device,
    },
    DeviceDeleted {
        device_id: String,
    },
    DeviceOnline {
        device_id: String,
    },
    DeviceOffline {
        device_id: String,
    },
    DeviceControl {
        device_id: String,
        command: DeviceCommand,
    },
    AutomationCreated {
        automation_id: String,
    },
    AutomationUpdated {
        automation_id: String,
    },
    AutomationDeleted {
        automation_id: String,
    },
    AutomationTriggered {
        automation_id: String,
    },
    AutomationCompleted {
        automation_id: String,
        outcome: RunOutcome,
    },
    Notification {
        automation_id: String,
        message: String,
    },
}

impl From<DeviceEvent> for WsEvent {
    fn from(event: DeviceEvent) -> Self {
        match event {
            DeviceEvent::Registered(device) => Self::DeviceRegistered { device },
            DeviceEvent::StateChanged {
                device_id,
                old_state,
                new_state,
                ..
            } => Self::DeviceStateChanged {
                device_id,
                old_state,
                new_state,
            },
            DeviceEvent::InfoUpdated(device) => Self::DeviceInfoUpdated { device },
            DeviceEvent::Deleted { device_id } => Self::DeviceDeleted { device_id },
            DeviceEvent::Online { device_id } => Self::DeviceOnline { device_id },
            DeviceEvent::Offline { device_id } => Self::DeviceOffline { device_id },
            DeviceEvent::Control { device_id, command } => {
                Self::DeviceControl { device_id, command }
            }
        }
    }
}

impl From<AutomationEvent> for WsEvent {
    fn from(event: AutomationEvent) -> Self {
        match event {
            AutomationEvent::Created { automation_id } => {
                Self::AutomationCreated { automation_id }
            }
            AutomationEvent::Updated { automation_id } => {
                Self::AutomationUpdated { automation_id }
            }
            AutomationEvent::Deleted { automation_id } => {
                Self::AutomationDeleted { automation_id }
            }
            AutomationEvent::Triggered { automation_id } => {
                Self::AutomationTriggered { automation_id }
            }
            AutomationEvent::Completed {
                automation_id,
                outcome,
            } => Self::AutomationCompleted {
                automation_id,
                outcome,
            },
            AutomationEvent::Notification {
                automation_id,
                message,
            } => Self::Notification {
                automation_id,
                message,
            },
        }
    }
}

/// Handle a WebSocket connection
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let Ok(connected) = serde_json::to_string(&WsEvent::Connected) else {
        return;
    };
    if sender.send(Message::Text(connected)).await.is_err() {
        return;
    }

    let mut device_rx = state.registry.subscribe();
    let mut automation_rx = state.engine.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let event: Option<WsEvent> = tokio::select! {
                device = device_rx.recv() => match device {
                    Ok(event) => Some(event.into()),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => None,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                automation = automation_rx.recv() => match automation {
                    Ok(event) => Some(event.into()),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => None,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            };

            if let Some(event) = event {
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    // Drain incoming frames until the client goes away; clients do not
    // send anything meaningful yet.
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    send_task.abort();
}
