//! Core automation engine
//!
//! Owns the automation table and the Running-Set, matches registry and
//! scheduler events to triggers, and drives condition evaluation and
//! action execution. `trigger()` is the sole entry point for firing an
//! automation and never lets an internal failure escape to the event
//! producer that invoked it.

use crate::error::AutomationError;
use crate::evaluator::ConditionEvaluator;
use crate::executor::ActionExecutor;
use crate::generate::{AutomationGenerator, GenerationContext};
use crate::model::{
    Automation, CreateAutomationRequest, ExecutionRecord, GenerationInfo, RunOutcome,
    Trigger, TriggerEvent, UpdateAutomationRequest,
};
use crate::scheduler::Scheduler;
use crate::store::AutomationStore;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use device_registry::{DeviceEvent, DeviceFilter, DeviceRegistry, StateMap};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Engine event channel capacity
const EVENT_CAPACITY: usize = 256;

/// Events emitted by the automation engine
#[derive(Debug, Clone)]
pub enum AutomationEvent {
    /// An automation was created
    Created { automation_id: String },
    /// An automation was updated
    Updated { automation_id: String },
    /// An automation was deleted
    Deleted { automation_id: String },
    /// An automation was triggered and entered evaluation
    Triggered { automation_id: String },
    /// A run finished and was journaled
    Completed {
        automation_id: String,
        outcome: RunOutcome,
    },
    /// A notify action fired
    Notification {
        automation_id: String,
        message: String,
    },
}

/// The main automation engine
pub struct AutomationEngine {
    /// All registered automations
    automations: DashMap<String, Automation>,
    /// Ids currently executing; sole guard against re-entrant runs
    running: DashSet<String>,
    /// Device registry, for condition reads and device-control actions
    registry: Arc<DeviceRegistry>,
    /// Condition evaluator
    evaluator: ConditionEvaluator,
    /// Action executor
    executor: ActionExecutor,
    /// Time-based trigger scheduler
    scheduler: Scheduler,
    /// Optional AI collaborator for natural-language creation
    generator: Option<Arc<dyn AutomationGenerator>>,
    /// Durable mirror for automations and run records
    store: Arc<dyn AutomationStore>,
    /// Event broadcaster
    event_tx: broadcast::Sender<AutomationEvent>,
}

impl AutomationEngine {
    /// Create an engine, loading persisted automations and arming timers
    /// for the enabled time-triggered ones.
    pub async fn new(
        registry: Arc<DeviceRegistry>,
        store: Arc<dyn AutomationStore>,
        generator: Option<Arc<dyn AutomationGenerator>>,
    ) -> Result<Self, AutomationError> {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let engine = Self {
            automations: DashMap::new(),
            running: DashSet::new(),
            evaluator: ConditionEvaluator::new(Arc::clone(&registry)),
            executor: ActionExecutor::new(Arc::clone(&registry), event_tx.clone()),
            scheduler: Scheduler::new(),
            registry,
            generator,
            store,
            event_tx,
        };

        for automation in engine.store.load_automations().await? {
            if let Err(e) = engine.scheduler.arm(&automation) {
                tracing::warn!("Failed to arm timer for automation {}: {}", automation.id, e);
            }
            engine.automations.insert(automation.id.clone(), automation);
        }

        Ok(engine)
    }

    /// Start the engine: subscribe to registry state changes and to the
    /// scheduler's timer events.
    pub fn start(self: &Arc<Self>) {
        self.start_device_listener();
        self.start_scheduler_listener();
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<AutomationEvent> {
        self.event_tx.subscribe()
    }

    /// Get all automations
    pub fn list(&self) -> Vec<Automation> {
        self.automations.iter().map(|r| r.value().clone()).collect()
    }

    /// Get an automation by ID
    pub fn get(&self, id: &str) -> Option<Automation> {
        self.automations.get(id).map(|r| r.value().clone())
    }

    /// Create a new automation
    pub async fn create(
        &self,
        request: CreateAutomationRequest,
    ) -> Result<Automation, AutomationError> {
        self.create_with_provenance(request, None, None).await
    }

    /// Create an automation from free text via the AI collaborator.
    ///
    /// Any collaborator failure or undecodable reply is a `Generation`
    /// error; nothing partial is created.
    pub async fn create_from_natural_language(
        &self,
        prompt: &str,
        user_id: &str,
    ) -> Result<Automation, AutomationError> {
        let Some(generator) = &self.generator else {
            return Err(AutomationError::Generation(
                "no automation generator configured".into(),
            ));
        };

        let context = GenerationContext {
            devices: self.registry.list(&DeviceFilter::default()),
            automations: self.list(),
        };

        let reply = generator
            .generate(prompt, &context)
            .await
            .map_err(AutomationError::Generation)?;
        let request: CreateAutomationRequest = serde_json::from_value(reply)
            .map_err(|e| AutomationError::Generation(format!("unusable generator reply: {e}")))?;

        self.create_with_provenance(
            request,
            Some(user_id.to_string()),
            Some(GenerationInfo {
                prompt: prompt.to_string(),
                model: None,
            }),
        )
        .await
    }

    async fn create_with_provenance(
        &self,
        request: CreateAutomationRequest,
        created_by: Option<String>,
        generated: Option<GenerationInfo>,
    ) -> Result<Automation, AutomationError> {
        let mut automation = Automation::from_request(request);
        automation.created_by = created_by;
        automation.generated = generated;
        automation.validate()?;

        self.store.put_automation(&automation).await?;
        self.automations
            .insert(automation.id.clone(), automation.clone());
        self.scheduler.arm(&automation)?;

        let _ = self.event_tx.send(AutomationEvent::Created {
            automation_id: automation.id.clone(),
        });
        tracing::info!(
            "Created automation: {} ({})",
            automation.name,
            automation.id
        );
        Ok(automation)
    }

    /// Update an automation; a changed trigger re-arms the timer.
    pub async fn update(
        &self,
        id: &str,
        request: UpdateAutomationRequest,
    ) -> Result<Automation, AutomationError> {
        let updated = {
            let mut entry = self
                .automations
                .get_mut(id)
                .ok_or_else(|| AutomationError::NotFound(id.to_string()))?;
            let mut candidate = entry.clone();
            candidate.apply_update(request);
            candidate.validate()?;
            *entry = candidate.clone();
            candidate
        };

        self.store.put_automation(&updated).await?;
        self.scheduler.arm(&updated)?;

        let _ = self.event_tx.send(AutomationEvent::Updated {
            automation_id: id.to_string(),
        });
        tracing::info!("Updated automation: {}", id);
        Ok(updated)
    }

    /// Delete an automation; cancels its timer and cascades its run records.
    pub async fn delete(&self, id: &str) -> Result<Automation, AutomationError> {
        let (_, automation) = self
            .automations
            .remove(id)
            .ok_or_else(|| AutomationError::NotFound(id.to_string()))?;

        self.scheduler.disarm(id);
        self.store.delete_automation(id).await?;

        let _ = self.event_tx.send(AutomationEvent::Deleted {
            automation_id: id.to_string(),
        });
        tracing::info!("Deleted automation: {} ({})", automation.name, id);
        Ok(automation)
    }

    /// Enable an automation
    pub async fn enable(&self, id: &str) -> Result<Automation, AutomationError> {
        self.update(
            id,
            UpdateAutomationRequest {
                enabled: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// Disable an automation; its timer is cancelled.
    pub async fn disable(&self, id: &str) -> Result<Automation, AutomationError> {
        self.update(
            id,
            UpdateAutomationRequest {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    /// Execution journal for an automation, newest first.
    pub async fn runs(
        &self,
        id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionRecord>, AutomationError> {
        if !self.automations.contains_key(id) {
            return Err(AutomationError::NotFound(id.to_string()));
        }
        Ok(self.store.runs(id, limit).await?)
    }

    /// Fire an automation.
    ///
    /// The sole entry point for execution, reachable from the scheduler,
    /// the registry subscription, or an explicit call. Unknown and
    /// disabled ids are silent no-ops; a trigger arriving while the same
    /// automation is already running is dropped, not queued.
    pub async fn trigger(&self, id: &str, event: TriggerEvent) {
        let Some(automation) = self.get(id) else {
            tracing::debug!("Ignoring trigger for unknown automation {}", id);
            return;
        };
        if !automation.enabled {
            tracing::debug!("Ignoring trigger for disabled automation {}", id);
            return;
        }

        if !self.running.insert(id.to_string()) {
            tracing::info!(
                "Automation {} is already running, dropping trigger",
                id
            );
            return;
        }
        // Released on every exit path, including panics inside the run.
        let _guard = RunningGuard {
            running: &self.running,
            id,
        };

        self.run(&automation, event).await;
    }

    /// Execute one run; all failures are captured into the journal.
    async fn run(&self, automation: &Automation, event: TriggerEvent) {
        tracing::info!(
            "Executing automation '{}' ({})",
            automation.name,
            automation.id
        );
        let _ = self.event_tx.send(AutomationEvent::Triggered {
            automation_id: automation.id.clone(),
        });
        let started = Utc::now();

        let (mut outcome, actions, mut error) =
            match self.evaluator.evaluate_all(&automation.conditions) {
                Ok(false) => {
                    tracing::debug!(
                        "Automation '{}' conditions not met, skipping",
                        automation.name
                    );
                    return;
                }
                Ok(true) => {
                    let outcomes = self
                        .executor
                        .execute(&automation.id, &automation.actions)
                        .await;
                    (RunOutcome::Success, outcomes, None)
                }
                Err(e) => {
                    tracing::error!(
                        "Condition evaluation failed for '{}': {}",
                        automation.name,
                        e
                    );
                    (RunOutcome::Error, Vec::new(), Some(e.to_string()))
                }
            };

        if outcome == RunOutcome::Success {
            // The user-visible counter must be durable before the journal
            // row exists.
            if let Err(e) = self.record_run_stats(&automation.id, started).await {
                tracing::warn!(
                    "Failed to persist run stats for {}: {}",
                    automation.id,
                    e
                );
                outcome = RunOutcome::Error;
                error = Some(e.to_string());
            }
        }

        let record = ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            automation_id: automation.id.clone(),
            outcome,
            event,
            actions,
            error,
            executed_at: Utc::now(),
        };
        if let Err(e) = self.store.append_run(&record).await {
            tracing::error!("Failed to journal run for {}: {}", automation.id, e);
        }

        let _ = self.event_tx.send(AutomationEvent::Completed {
            automation_id: automation.id.clone(),
            outcome,
        });
    }

    async fn record_run_stats(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AutomationError> {
        let snapshot = {
            // Deleted out-of-band mid-run: nothing left to account against.
            let Some(mut entry) = self.automations.get_mut(id) else {
                return Ok(());
            };
            entry.trigger_count += 1;
            entry.last_triggered = Some(at);
            entry.clone()
        };
        self.store.put_automation(&snapshot).await?;
        Ok(())
    }

    fn start_device_listener(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.registry.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(DeviceEvent::StateChanged {
                        device_id,
                        old_state,
                        new_state,
                        ..
                    }) => {
                        engine.dispatch_state_change(&device_id, &old_state, &new_state);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Automation engine lagged by {} device events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Device event channel closed");
                        break;
                    }
                }
            }
        });
    }

    /// Spawn a trigger task for every enabled automation whose state
    /// trigger matches the observed change. Each run is its own task, so
    /// a slow automation never stalls the event loop or its peers.
    fn dispatch_state_change(
        self: &Arc<Self>,
        device_id: &str,
        old_state: &StateMap,
        new_state: &StateMap,
    ) {
        for entry in self.automations.iter() {
            let automation = entry.value();
            if !automation.enabled {
                continue;
            }
            if !state_trigger_matches(&automation.trigger, device_id, old_state, new_state) {
                continue;
            }

            let engine = Arc::clone(self);
            let id = automation.id.clone();
            let event = TriggerEvent::StateChange {
                device_id: device_id.to_string(),
                old_state: old_state.clone(),
                new_state: new_state.clone(),
            };
            tokio::spawn(async move {
                engine.trigger(&id, event).await;
            });
        }
    }

    fn start_scheduler_listener(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.scheduler.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            engine
                                .trigger(
                                    &event.automation_id,
                                    TriggerEvent::Time {
                                        timestamp: Utc::now(),
                                    },
                                )
                                .await;
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Scheduler listener lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Scheduler event channel closed");
                        break;
                    }
                }
            }
        });
    }
}

/// Evaluate a state trigger against an observed old/new state pair.
fn state_trigger_matches(
    trigger: &Trigger,
    device_id: &str,
    old_state: &StateMap,
    new_state: &StateMap,
) -> bool {
    let Trigger::DeviceState {
        device_id: watched,
        property,
        operator,
        value,
    } = trigger
    else {
        return false;
    };
    if watched != device_id {
        return false;
    }
    operator.matches(old_state.get(property), new_state.get(property), value)
}

struct RunningGuard<'a> {
    running: &'a DashSet<String>,
    id: &'a str,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriggerOp;
    use serde_json::json;

    fn state(pairs: &[(&str, serde_json::Value)]) -> StateMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn watch(device_id: &str, property: &str, operator: TriggerOp, value: serde_json::Value) -> Trigger {
        Trigger::DeviceState {
            device_id: device_id.into(),
            property: property.into(),
            operator,
            value,
        }
    }

    #[test]
    fn state_trigger_requires_matching_device() {
        let trigger = watch("x", "on", TriggerOp::Equals, json!(true));
        assert!(state_trigger_matches(
            &trigger,
            "x",
            &state(&[]),
            &state(&[("on", json!(true))]),
        ));
        assert!(!state_trigger_matches(
            &trigger,
            "y",
            &state(&[]),
            &state(&[("on", json!(true))]),
        ));
    }

    #[test]
    fn state_trigger_applies_operator_to_watched_property() {
        let trigger = watch("x", "temperature", TriggerOp::GreaterThan, json!(25));
        assert!(state_trigger_matches(
            &trigger,
            "x",
            &state(&[("temperature", json!(20))]),
            &state(&[("temperature", json!(30))]),
        ));
        assert!(!state_trigger_matches(
            &trigger,
            "x",
            &state(&[("temperature", json!(30))]),
            &state(&[("temperature", json!(20))]),
        ));
        // Unrelated property changes leave the watched property untouched.
        let changed = watch("x", "on", TriggerOp::ChangesTo, json!(true));
        assert!(!state_trigger_matches(
            &changed,
            "x",
            &state(&[("on", json!(true)), ("brightness", json!(10))]),
            &state(&[("on", json!(true)), ("brightness", json!(90))]),
        ));
    }

    #[test]
    fn time_triggers_never_match_state_changes() {
        let trigger = Trigger::Time {
            schedule: crate::model::ScheduleSpec::Interval { seconds: 60 },
        };
        assert!(!state_trigger_matches(
            &trigger,
            "x",
            &state(&[]),
            &state(&[("on", json!(true))]),
        ));
    }
}
