//! Action executor for automations

use crate::engine::AutomationEvent;
use crate::error::AutomationError;
use crate::model::{Action, ActionOutcome};
use device_registry::{Actor, DeviceRegistry};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Executor for automation actions
pub struct ActionExecutor {
    registry: Arc<DeviceRegistry>,
    event_tx: broadcast::Sender<AutomationEvent>,
}

impl ActionExecutor {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        event_tx: broadcast::Sender<AutomationEvent>,
    ) -> Self {
        Self { registry, event_tx }
    }

    /// Execute an automation's actions in order.
    ///
    /// A failing action is recorded and does not abort the rest of the
    /// list; the caller decides what the per-action results mean for the
    /// run as a whole.
    pub async fn execute(&self, automation_id: &str, actions: &[Action]) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::with_capacity(actions.len());
        for (index, action) in actions.iter().enumerate() {
            let outcome = match self.execute_action(automation_id, action).await {
                Ok(()) => ActionOutcome {
                    index,
                    kind: action.kind().to_string(),
                    success: true,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(
                        "Action {} of automation {} failed: {}",
                        index,
                        automation_id,
                        e
                    );
                    ActionOutcome {
                        index,
                        kind: action.kind().to_string(),
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn execute_action(
        &self,
        automation_id: &str,
        action: &Action,
    ) -> Result<(), AutomationError> {
        match action {
            Action::DeviceControl { device_id, command } => self
                .registry
                .control(
                    device_id,
                    command.clone(),
                    Actor::Automation {
                        id: automation_id.to_string(),
                    },
                )
                .await
                .map_err(|e| AutomationError::DeviceControlFailed(e.to_string())),
            Action::Delay { seconds } => {
                tracing::debug!("Delaying for {} seconds", seconds);
                tokio::time::sleep(std::time::Duration::from_secs(*seconds)).await;
                Ok(())
            }
            Action::Notify { message } => {
                let _ = self.event_tx.send(AutomationEvent::Notification {
                    automation_id: automation_id.to_string(),
                    message: message.clone(),
                });
                Ok(())
            }
        }
    }
}
