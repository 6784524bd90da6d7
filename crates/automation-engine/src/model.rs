//! Data models for the automation engine
//!
//! Trigger, condition, and action payloads are tagged unions with fixed
//! shapes, decoded and validated once at creation time.

use crate::error::AutomationError;
use chrono::{DateTime, Utc};
use cron::Schedule;
use device_registry::{DeviceCommand, StateMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// A complete automation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    /// Unique identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the automation is active
    pub enabled: bool,
    /// What initiates the automation
    pub trigger: Trigger,
    /// Additional predicates; all must hold
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Effects executed sequentially when triggered and conditions hold
    pub actions: Vec<Action>,
    /// User who created the automation, if any
    #[serde(default)]
    pub created_by: Option<String>,
    /// Provenance for AI-generated automations
    #[serde(default)]
    pub generated: Option<GenerationInfo>,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trigger_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Trigger types that can initiate an automation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire on a schedule
    Time { schedule: ScheduleSpec },
    /// Fire when a watched device property changes in a matching way
    DeviceState {
        device_id: String,
        property: String,
        operator: TriggerOp,
        value: Value,
    },
}

/// Schedule specification for time triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Run at a time of day, optionally restricted to days of the week
    /// (0 = Sunday .. 6 = Saturday); converted to a cron expression
    TimeOfDay {
        /// Time in HH:MM format (24-hour)
        time: String,
        #[serde(default)]
        days: Vec<u8>,
    },
    /// Standard cron expression (e.g. "0 30 9 * * *" for 9:30 AM daily)
    Cron { expression: String },
    /// Fixed interval in seconds
    Interval { seconds: u64 },
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

impl ScheduleSpec {
    /// Check the schedule is well-formed; `create`/`update` reject bad ones.
    pub fn validate(&self) -> Result<(), AutomationError> {
        match self {
            Self::TimeOfDay { .. } | Self::Cron { .. } => {
                self.cron_expression()?;
                Ok(())
            }
            Self::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(AutomationError::InvalidTrigger(
                        "interval must be at least one second".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// The cron expression this schedule arms with; `None` for intervals.
    pub fn cron_expression(&self) -> Result<Option<String>, AutomationError> {
        match self {
            Self::TimeOfDay { time, days } => {
                let parsed = chrono::NaiveTime::parse_from_str(time, "%H:%M")
                    .map_err(|_| AutomationError::InvalidTimeFormat(time.clone()))?;
                let day_field = if days.is_empty() {
                    "*".to_string()
                } else {
                    let mut names = Vec::with_capacity(days.len());
                    for day in days {
                        let name = DAY_NAMES.get(*day as usize).ok_or_else(|| {
                            AutomationError::InvalidTrigger(format!("invalid day of week: {day}"))
                        })?;
                        names.push(*name);
                    }
                    names.join(",")
                };
                use chrono::Timelike;
                let expression =
                    format!("0 {} {} * * {}", parsed.minute(), parsed.hour(), day_field);
                // The conversion is total for valid inputs, but double-check.
                Schedule::from_str(&expression)
                    .map_err(|e| AutomationError::InvalidCron(format!("{expression}: {e}")))?;
                Ok(Some(expression))
            }
            Self::Cron { expression } => {
                Schedule::from_str(expression)
                    .map_err(|e| AutomationError::InvalidCron(format!("{expression}: {e}")))?;
                Ok(Some(expression.clone()))
            }
            Self::Interval { .. } => Ok(None),
        }
    }
}

/// How a watched property's old/new values are compared for state triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOp {
    Equals,
    ChangesTo,
    ChangesFrom,
    GreaterThan,
    LessThan,
    Changes,
}

impl TriggerOp {
    /// Evaluate the operator against the observed old/new property values.
    ///
    /// Equality is deep value equality; the ordered operators only match
    /// when the new value is numeric.
    #[must_use]
    pub fn matches(self, old: Option<&Value>, new: Option<&Value>, expected: &Value) -> bool {
        match self {
            Self::Equals => new == Some(expected),
            Self::ChangesTo => new == Some(expected) && old != Some(expected),
            Self::ChangesFrom => old == Some(expected) && new != Some(expected),
            Self::GreaterThan => match (as_number(new), expected.as_f64()) {
                (Some(actual), Some(limit)) => actual > limit,
                _ => false,
            },
            Self::LessThan => match (as_number(new), expected.as_f64()) {
                (Some(actual), Some(limit)) => actual < limit,
                _ => false,
            },
            Self::Changes => new != old,
        }
    }
}

fn as_number(value: Option<&Value>) -> Option<f64> {
    value?.as_f64()
}

/// How a condition compares a property's current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
}

/// Predicates gating whether a triggered automation proceeds to actions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Compare a device property's current value
    DeviceState {
        device_id: String,
        property: String,
        operator: ConditionOp,
        value: Value,
    },
    /// Current time within [after, before], inclusive, minute resolution.
    /// A window that wraps midnight is not supported and never holds.
    TimeOfDay { after: String, before: String },
    /// Current day of week in the set (0 = Sunday); empty means every day
    DayOfWeek { days: Vec<u8> },
    /// Condition kinds this build does not know; vacuously true
    #[serde(other)]
    Unknown,
}

/// Effects performed when an automation fires
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Issue a command through the registry toward the protocol adapter
    DeviceControl {
        device_id: String,
        command: DeviceCommand,
    },
    /// Suspend this automation's run (only) for a literal duration
    Delay { seconds: u64 },
    /// Fire-and-forget message onto the notification bus
    Notify { message: String },
}

impl Action {
    /// Short kind tag recorded in per-action outcomes
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceControl { .. } => "device_control",
            Self::Delay { .. } => "delay",
            Self::Notify { .. } => "notify",
        }
    }
}

/// Provenance of an AI-generated automation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationInfo {
    /// The natural-language prompt the automation was generated from
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// The payload handed to `trigger()`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEvent {
    /// A scheduler timer fired
    Time { timestamp: DateTime<Utc> },
    /// A registry state change matched the automation's trigger
    StateChange {
        device_id: String,
        old_state: StateMap,
        new_state: StateMap,
    },
    /// Explicit API call
    Manual {
        #[serde(default)]
        requested_by: Option<String>,
    },
}

/// Overall outcome of one automation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The run completed; individual actions may still have failed
    Success,
    /// The run aborted outside action execution
    Error,
}

/// Result of a single action within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub index: usize,
    pub kind: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Immutable journal entry for one automation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub automation_id: String,
    pub outcome: RunOutcome,
    /// The event that triggered the run
    pub event: TriggerEvent,
    /// Per-action results, in execution order
    pub actions: Vec<ActionOutcome>,
    #[serde(default)]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Request to create a new automation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAutomationRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: Trigger,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}

/// Request to update an automation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAutomationRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default)]
    pub actions: Option<Vec<Action>>,
}

impl Automation {
    /// Create a new automation from a create request
    #[must_use]
    pub fn from_request(request: CreateAutomationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            description: request.description,
            enabled: request.enabled,
            trigger: request.trigger,
            conditions: request.conditions,
            actions: request.actions,
            created_by: None,
            generated: None,
            last_triggered: None,
            trigger_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an update request to this automation
    pub fn apply_update(&mut self, update: UpdateAutomationRequest) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(trigger) = update.trigger {
            self.trigger = trigger;
        }
        if let Some(conditions) = update.conditions {
            self.conditions = conditions;
        }
        if let Some(actions) = update.actions {
            self.actions = actions;
        }
        self.updated_at = Utc::now();
    }

    /// Validate the trigger payload; called on create and update.
    pub fn validate(&self) -> Result<(), AutomationError> {
        match &self.trigger {
            Trigger::Time { schedule } => schedule.validate(),
            Trigger::DeviceState {
                device_id,
                property,
                ..
            } => {
                if device_id.trim().is_empty() || property.trim().is_empty() {
                    return Err(AutomationError::InvalidTrigger(
                        "state trigger needs a device id and a property".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equals_matches_on_new_value_only() {
        let op = TriggerOp::Equals;
        assert!(op.matches(Some(&json!(true)), Some(&json!(true)), &json!(true)));
        assert!(op.matches(None, Some(&json!(true)), &json!(true)));
        assert!(!op.matches(Some(&json!(true)), Some(&json!(false)), &json!(true)));
    }

    #[test]
    fn changes_to_requires_a_transition() {
        let op = TriggerOp::ChangesTo;
        assert!(op.matches(Some(&json!(false)), Some(&json!(true)), &json!(true)));
        assert!(!op.matches(Some(&json!(true)), Some(&json!(true)), &json!(true)));
        // Property appearing for the first time counts as a transition.
        assert!(op.matches(None, Some(&json!(true)), &json!(true)));
    }

    #[test]
    fn changes_from_requires_leaving_the_value() {
        let op = TriggerOp::ChangesFrom;
        assert!(op.matches(Some(&json!("home")), Some(&json!("away")), &json!("home")));
        assert!(!op.matches(Some(&json!("home")), Some(&json!("home")), &json!("home")));
        assert!(!op.matches(Some(&json!("away")), Some(&json!("home")), &json!("home")));
    }

    #[test]
    fn ordered_operators_are_numeric_only() {
        assert!(TriggerOp::GreaterThan.matches(None, Some(&json!(30)), &json!(21)));
        assert!(!TriggerOp::GreaterThan.matches(None, Some(&json!(15)), &json!(21)));
        assert!(!TriggerOp::GreaterThan.matches(None, Some(&json!("30")), &json!(21)));
        assert!(TriggerOp::LessThan.matches(None, Some(&json!(10.5)), &json!(21)));
        assert!(!TriggerOp::LessThan.matches(None, None, &json!(21)));
    }

    #[test]
    fn changes_is_deep_inequality() {
        let op = TriggerOp::Changes;
        assert!(op.matches(Some(&json!({"a": 1})), Some(&json!({"a": 2})), &json!(null)));
        assert!(!op.matches(Some(&json!({"a": 1})), Some(&json!({"a": 1})), &json!(null)));
        assert!(op.matches(None, Some(&json!(1)), &json!(null)));
    }

    #[test]
    fn time_of_day_converts_to_cron() {
        let spec = ScheduleSpec::TimeOfDay {
            time: "07:45".into(),
            days: vec![1, 5],
        };
        assert_eq!(
            spec.cron_expression().unwrap().as_deref(),
            Some("0 45 7 * * MON,FRI")
        );

        let daily = ScheduleSpec::TimeOfDay {
            time: "23:00".into(),
            days: vec![],
        };
        assert_eq!(
            daily.cron_expression().unwrap().as_deref(),
            Some("0 0 23 * * *")
        );
    }

    #[test]
    fn malformed_schedules_are_rejected() {
        assert!(matches!(
            ScheduleSpec::TimeOfDay {
                time: "25:99".into(),
                days: vec![]
            }
            .validate(),
            Err(AutomationError::InvalidTimeFormat(_))
        ));
        assert!(matches!(
            ScheduleSpec::TimeOfDay {
                time: "08:00".into(),
                days: vec![7]
            }
            .validate(),
            Err(AutomationError::InvalidTrigger(_))
        ));
        assert!(matches!(
            ScheduleSpec::Cron {
                expression: "not a cron".into()
            }
            .validate(),
            Err(AutomationError::InvalidCron(_))
        ));
        assert!(matches!(
            ScheduleSpec::Interval { seconds: 0 }.validate(),
            Err(AutomationError::InvalidTrigger(_))
        ));
    }

    #[test]
    fn unknown_condition_tags_decode_to_unknown() {
        let condition: Condition =
            serde_json::from_value(json!({"type": "sun_elevation", "above": 10})).unwrap();
        assert!(matches!(condition, Condition::Unknown));
    }
}
