//! End-to-end engine scenarios over an in-memory registry and store

use async_trait::async_trait;
use automation_engine::{
    Action, AutomationEngine, AutomationGenerator, CreateAutomationRequest, GenerationContext,
    RunOutcome, ScheduleSpec, Trigger, TriggerEvent, TriggerOp,
};
use device_registry::{
    Actor, DeviceCommand, DeviceRegistry, DeviceSpec, MemoryDeviceStore, StateMap,
};
use automation_engine::MemoryAutomationStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn setup() -> (Arc<DeviceRegistry>, Arc<AutomationEngine>) {
    setup_with_generator(None).await
}

async fn setup_with_generator(
    generator: Option<Arc<dyn AutomationGenerator>>,
) -> (Arc<DeviceRegistry>, Arc<AutomationEngine>) {
    let registry = Arc::new(
        DeviceRegistry::new(Arc::new(MemoryDeviceStore::new()))
            .await
            .unwrap(),
    );
    let engine = Arc::new(
        AutomationEngine::new(
            Arc::clone(&registry),
            Arc::new(MemoryAutomationStore::new()),
            generator,
        )
        .await
        .unwrap(),
    );
    engine.start();
    (registry, engine)
}

async fn register_light(registry: &DeviceRegistry, name: &str) -> String {
    registry
        .register(DeviceSpec {
            name: name.into(),
            device_type: "light".into(),
            protocol: "zigbee".into(),
            address: None,
            manufacturer: None,
            model: None,
            firmware: None,
            room: None,
            capabilities: vec!["on_off".into()],
            metadata: StateMap::new(),
        })
        .await
        .unwrap()
        .id
}

fn state(pairs: &[(&str, serde_json::Value)]) -> StateMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn turn_on(device_id: &str) -> Action {
    Action::DeviceControl {
        device_id: device_id.into(),
        command: DeviceCommand {
            name: "turn_on".into(),
            parameters: StateMap::new(),
        },
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition was not reached in time");
}

#[tokio::test]
async fn state_trigger_controls_other_device() {
    let (registry, engine) = setup().await;
    let sensor = register_light(&registry, "sensor").await;
    let lamp = register_light(&registry, "lamp").await;

    let automation = engine
        .create(CreateAutomationRequest {
            name: "lamp follows sensor".into(),
            description: None,
            enabled: true,
            trigger: Trigger::DeviceState {
                device_id: sensor.clone(),
                property: "on".into(),
                operator: TriggerOp::Equals,
                value: json!(true),
            },
            conditions: vec![],
            actions: vec![turn_on(&lamp)],
        })
        .await
        .unwrap();

    registry
        .update_state(&sensor, state(&[("on", json!(true))]), Actor::Protocol)
        .await
        .unwrap();

    let registry_check = Arc::clone(&registry);
    let lamp_check = lamp.clone();
    eventually(move || {
        registry_check
            .get(&lamp_check)
            .and_then(|d| d.state.get("on").cloned())
            == Some(json!(true))
    })
    .await;

    let engine_check = Arc::clone(&engine);
    let automation_id = automation.id.clone();
    eventually(move || {
        engine_check
            .get(&automation_id)
            .is_some_and(|a| a.trigger_count == 1)
    })
    .await;

    // The lamp's history attributes the change to the automation.
    let history = registry.history(&lamp, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(
        history[0].actor,
        Actor::Automation {
            id: automation.id.clone()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_trigger_is_dropped_while_running() {
    let (_registry, engine) = setup().await;

    let automation = engine
        .create(CreateAutomationRequest {
            name: "slow".into(),
            description: None,
            enabled: true,
            trigger: Trigger::Time {
                schedule: ScheduleSpec::Interval { seconds: 3600 },
            },
            conditions: vec![],
            actions: vec![Action::Delay { seconds: 5 }],
        })
        .await
        .unwrap();

    let first = engine.trigger(
        &automation.id,
        TriggerEvent::Manual {
            requested_by: None,
        },
    );
    let second = engine.trigger(
        &automation.id,
        TriggerEvent::Manual {
            requested_by: None,
        },
    );
    tokio::join!(first, second);

    // Only the first trigger produced a run; the second was dropped.
    let runs = engine.runs(&automation.id, None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(engine.get(&automation.id).unwrap().trigger_count, 1);

    // The guard released; a later trigger runs again.
    engine
        .trigger(
            &automation.id,
            TriggerEvent::Manual {
                requested_by: None,
            },
        )
        .await;
    assert_eq!(engine.runs(&automation.id, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn failing_action_does_not_abort_the_rest() {
    let (registry, engine) = setup().await;
    let lamp = register_light(&registry, "lamp").await;

    let automation = engine
        .create(CreateAutomationRequest {
            name: "partially broken".into(),
            description: None,
            enabled: true,
            trigger: Trigger::Time {
                schedule: ScheduleSpec::Interval { seconds: 3600 },
            },
            conditions: vec![],
            actions: vec![turn_on("no-such-device"), turn_on(&lamp)],
        })
        .await
        .unwrap();

    engine
        .trigger(
            &automation.id,
            TriggerEvent::Manual {
                requested_by: None,
            },
        )
        .await;

    let runs = engine.runs(&automation.id, None).await.unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];

    // Action failures are partial-failure data, not automation failure.
    assert_eq!(run.outcome, RunOutcome::Success);
    assert_eq!(run.actions.len(), 2);
    assert!(!run.actions[0].success);
    assert!(run.actions[0].error.is_some());
    assert!(run.actions[1].success);
    assert_eq!(
        registry.get(&lamp).unwrap().state.get("on"),
        Some(&json!(true))
    );
}

#[tokio::test]
async fn unknown_and_disabled_triggers_are_silent_noops() {
    let (_registry, engine) = setup().await;

    engine
        .trigger(
            "no-such-automation",
            TriggerEvent::Manual {
                requested_by: None,
            },
        )
        .await;

    let automation = engine
        .create(CreateAutomationRequest {
            name: "dormant".into(),
            description: None,
            enabled: false,
            trigger: Trigger::Time {
                schedule: ScheduleSpec::Interval { seconds: 3600 },
            },
            conditions: vec![],
            actions: vec![Action::Notify {
                message: "never".into(),
            }],
        })
        .await
        .unwrap();

    engine
        .trigger(
            &automation.id,
            TriggerEvent::Manual {
                requested_by: None,
            },
        )
        .await;

    assert!(engine.runs(&automation.id, None).await.unwrap().is_empty());
    assert_eq!(engine.get(&automation.id).unwrap().trigger_count, 0);
}

#[tokio::test]
async fn run_bookkeeping_matches_journal() {
    let (_registry, engine) = setup().await;

    let automation = engine
        .create(CreateAutomationRequest {
            name: "bookkeeper".into(),
            description: None,
            enabled: true,
            trigger: Trigger::Time {
                schedule: ScheduleSpec::Interval { seconds: 3600 },
            },
            conditions: vec![],
            actions: vec![Action::Notify {
                message: "ran".into(),
            }],
        })
        .await
        .unwrap();

    for _ in 0..3 {
        engine
            .trigger(
                &automation.id,
                TriggerEvent::Manual {
                    requested_by: None,
                },
            )
            .await;
    }

    let updated = engine.get(&automation.id).unwrap();
    assert_eq!(updated.trigger_count, 3);
    assert!(updated.last_triggered.is_some());
    assert_eq!(engine.runs(&automation.id, None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn update_rearms_and_disable_cancels() {
    let (_registry, engine) = setup().await;

    let automation = engine
        .create(CreateAutomationRequest {
            name: "nightly".into(),
            description: None,
            enabled: true,
            trigger: Trigger::Time {
                schedule: ScheduleSpec::TimeOfDay {
                    time: "22:00".into(),
                    days: vec![],
                },
            },
            conditions: vec![],
            actions: vec![Action::Notify {
                message: "night".into(),
            }],
        })
        .await
        .unwrap();

    // Malformed replacement schedules are rejected without touching the
    // stored automation.
    let err = engine
        .update(
            &automation.id,
            automation_engine::UpdateAutomationRequest {
                trigger: Some(Trigger::Time {
                    schedule: ScheduleSpec::TimeOfDay {
                        time: "26:00".into(),
                        days: vec![],
                    },
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());
    match &engine.get(&automation.id).unwrap().trigger {
        Trigger::Time {
            schedule: ScheduleSpec::TimeOfDay { time, .. },
        } => assert_eq!(time, "22:00"),
        other => panic!("trigger was clobbered: {other:?}"),
    }

    let disabled = engine.disable(&automation.id).await.unwrap();
    assert!(!disabled.enabled);

    engine
        .trigger(
            &automation.id,
            TriggerEvent::Time {
                timestamp: chrono::Utc::now(),
            },
        )
        .await;
    assert!(engine.runs(&automation.id, None).await.unwrap().is_empty());
}

struct ScriptedGenerator(serde_json::Value);

#[async_trait]
impl AutomationGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _context: &GenerationContext,
    ) -> Result<serde_json::Value, String> {
        Ok(self.0.clone())
    }
}

struct FailingGenerator;

#[async_trait]
impl AutomationGenerator for FailingGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _context: &GenerationContext,
    ) -> Result<serde_json::Value, String> {
        Err("provider timeout".into())
    }
}

#[tokio::test]
async fn natural_language_creation_attaches_provenance() {
    let reply = json!({
        "name": "evening lights",
        "trigger": {
            "type": "time",
            "schedule": {"type": "time_of_day", "time": "18:30", "days": []}
        },
        "actions": [
            {"type": "notify", "message": "lights on"}
        ]
    });
    let (_registry, engine) =
        setup_with_generator(Some(Arc::new(ScriptedGenerator(reply)))).await;

    let automation = engine
        .create_from_natural_language("turn the lights on in the evening", "user-1")
        .await
        .unwrap();

    assert_eq!(automation.created_by.as_deref(), Some("user-1"));
    let generated = automation.generated.expect("provenance recorded");
    assert_eq!(generated.prompt, "turn the lights on in the evening");
    assert!(engine.get(&automation.id).is_some());
}

#[tokio::test]
async fn unusable_generator_reply_creates_nothing() {
    let (_registry, engine) = setup_with_generator(Some(Arc::new(ScriptedGenerator(
        json!("sure, here's your automation!"),
    ))))
    .await;

    let err = engine
        .create_from_natural_language("do the thing", "user-1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        automation_engine::AutomationError::Generation(_)
    ));
    assert!(engine.list().is_empty());

    let (_registry, engine) = setup_with_generator(Some(Arc::new(FailingGenerator))).await;
    let err = engine
        .create_from_natural_language("do the thing", "user-1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        automation_engine::AutomationError::Generation(_)
    ));
    assert!(engine.list().is_empty());
}

#[tokio::test]
async fn condition_gates_actions() {
    let (registry, engine) = setup().await;
    let sensor = register_light(&registry, "sensor").await;
    let lamp = register_light(&registry, "lamp").await;

    // Gate on a second device that is currently off.
    let gate = register_light(&registry, "gate").await;
    registry
        .update_state(&gate, state(&[("on", json!(false))]), Actor::Protocol)
        .await
        .unwrap();

    let automation = engine
        .create(CreateAutomationRequest {
            name: "gated".into(),
            description: None,
            enabled: true,
            trigger: Trigger::DeviceState {
                device_id: sensor.clone(),
                property: "on".into(),
                operator: TriggerOp::ChangesTo,
                value: json!(true),
            },
            conditions: vec![automation_engine::Condition::DeviceState {
                device_id: gate.clone(),
                property: "on".into(),
                operator: automation_engine::ConditionOp::Equals,
                value: json!(true),
            }],
            actions: vec![turn_on(&lamp)],
        })
        .await
        .unwrap();

    registry
        .update_state(&sensor, state(&[("on", json!(true))]), Actor::Protocol)
        .await
        .unwrap();

    // Give the pipeline a moment; the gate holds, so nothing may happen.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(registry.get(&lamp).unwrap().state.get("on").is_none());
    assert!(engine.runs(&automation.id, None).await.unwrap().is_empty());

    // Open the gate and re-trigger.
    registry
        .update_state(&gate, state(&[("on", json!(true))]), Actor::Protocol)
        .await
        .unwrap();
    registry
        .update_state(&sensor, state(&[("on", json!(false))]), Actor::Protocol)
        .await
        .unwrap();
    registry
        .update_state(&sensor, state(&[("on", json!(true))]), Actor::Protocol)
        .await
        .unwrap();

    let registry_check = Arc::clone(&registry);
    let lamp_check = lamp.clone();
    eventually(move || {
        registry_check
            .get(&lamp_check)
            .and_then(|d| d.state.get("on").cloned())
            == Some(json!(true))
    })
    .await;
}
