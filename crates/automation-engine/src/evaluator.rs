//! Condition evaluator for automations

use crate::error::AutomationError;
use crate::model::{Condition, ConditionOp};
use chrono::{Datelike, Local, NaiveTime, Timelike};
use device_registry::DeviceRegistry;
use serde_json::Value;
use std::sync::Arc;

/// Evaluator for automation conditions
pub struct ConditionEvaluator {
    registry: Arc<DeviceRegistry>,
}

impl ConditionEvaluator {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Evaluate all conditions (AND semantics, short-circuit on first false).
    /// No conditions means "always proceed".
    pub fn evaluate_all(&self, conditions: &[Condition]) -> Result<bool, AutomationError> {
        for condition in conditions {
            if !self.evaluate(condition)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate a single condition
    pub fn evaluate(&self, condition: &Condition) -> Result<bool, AutomationError> {
        match condition {
            Condition::DeviceState {
                device_id,
                property,
                operator,
                value,
            } => Ok(self.evaluate_device_state(device_id, property, *operator, value)),
            Condition::TimeOfDay { after, before } => {
                let after = parse_time(after)?;
                let before = parse_time(before)?;
                Ok(time_window_holds(Local::now().time(), after, before))
            }
            Condition::DayOfWeek { days } => {
                let today = Local::now().weekday().num_days_from_sunday() as u8;
                Ok(day_of_week_holds(today, days))
            }
            Condition::Unknown => {
                tracing::warn!("Unknown condition type, treating as satisfied");
                Ok(true)
            }
        }
    }

    fn evaluate_device_state(
        &self,
        device_id: &str,
        property: &str,
        operator: ConditionOp,
        expected: &Value,
    ) -> bool {
        let Some(device) = self.registry.get(device_id) else {
            // An unknown device cannot satisfy a state predicate.
            return false;
        };
        let actual = device.state.get(property);
        match operator {
            ConditionOp::Equals => actual == Some(expected),
            ConditionOp::NotEquals => actual != Some(expected),
            ConditionOp::GreaterThan => match (actual.and_then(Value::as_f64), expected.as_f64()) {
                (Some(actual), Some(limit)) => actual > limit,
                _ => false,
            },
            ConditionOp::LessThan => match (actual.and_then(Value::as_f64), expected.as_f64()) {
                (Some(actual), Some(limit)) => actual < limit,
                _ => false,
            },
        }
    }
}

/// Inclusive minute-resolution window check. Windows do not wrap midnight:
/// `after > before` never holds.
fn time_window_holds(now: NaiveTime, after: NaiveTime, before: NaiveTime) -> bool {
    if after > before {
        return false;
    }
    let minute = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now);
    minute >= after && minute <= before
}

/// Empty set means every day
fn day_of_week_holds(today: u8, days: &[u8]) -> bool {
    days.is_empty() || days.contains(&today)
}

/// Parse a time string in HH:MM format
fn parse_time(s: &str) -> Result<NaiveTime, AutomationError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| AutomationError::InvalidTimeFormat(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn window_is_inclusive_both_ends() {
        let after = t(9, 0);
        let before = t(17, 0);
        assert!(time_window_holds(t(9, 0), after, before));
        assert!(time_window_holds(t(17, 0), after, before));
        assert!(time_window_holds(t(12, 30), after, before));
        assert!(!time_window_holds(t(8, 59), after, before));
        assert!(!time_window_holds(t(17, 1), after, before));
    }

    #[test]
    fn window_ignores_seconds() {
        let now = NaiveTime::from_hms_opt(17, 0, 59).unwrap();
        assert!(time_window_holds(now, t(9, 0), t(17, 0)));
    }

    #[test]
    fn wrapping_window_never_holds() {
        // 22:00-06:00 is not supported; the window never matches.
        assert!(!time_window_holds(t(23, 0), t(22, 0), t(6, 0)));
        assert!(!time_window_holds(t(5, 0), t(22, 0), t(6, 0)));
    }

    #[test]
    fn day_set_is_every_day_when_empty() {
        assert!(day_of_week_holds(3, &[]));
        assert!(day_of_week_holds(0, &[0, 6]));
        assert!(!day_of_week_holds(2, &[0, 6]));
    }
}
