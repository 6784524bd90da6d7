//! Scheduler for time-based automation triggers
//!
//! One timer task per enabled time automation, keyed by automation id.
//! Arming always cancels the prior timer first, so duplicate timers for
//! the same id never coexist. A timer never disarms itself; it recurs
//! until the automation is disabled or deleted.

use crate::error::AutomationError;
use crate::model::{Automation, ScheduleSpec, Trigger};
use chrono::Local;
use cron::Schedule;
use dashmap::DashMap;
use std::str::FromStr;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Events emitted by the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerEvent {
    pub automation_id: String,
}

/// Scheduler for managing time-based automation triggers
pub struct Scheduler {
    /// Active timer handles (keyed by automation ID)
    timers: DashMap<String, JoinHandle<()>>,
    /// Event sender for scheduled triggers
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            timers: DashMap::new(),
            event_tx,
        }
    }

    /// Subscribe to scheduler events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// Arm (or re-arm) the timer for an automation.
    ///
    /// Cancels any existing timer for the id; automations without a time
    /// trigger, and disabled automations, end up with no timer.
    pub fn arm(&self, automation: &Automation) -> Result<(), AutomationError> {
        self.disarm(&automation.id);

        let Trigger::Time { schedule } = &automation.trigger else {
            return Ok(());
        };
        if !automation.enabled {
            return Ok(());
        }

        match schedule {
            ScheduleSpec::Interval { seconds } => {
                self.arm_interval(&automation.id, *seconds);
            }
            other => {
                if let Some(expression) = other.cron_expression()? {
                    self.arm_cron(&automation.id, &expression)?;
                }
            }
        }
        Ok(())
    }

    /// Cancel the timer for an automation, if one is armed.
    pub fn disarm(&self, automation_id: &str) {
        if let Some((_, handle)) = self.timers.remove(automation_id) {
            handle.abort();
            tracing::debug!("Disarmed timer for automation {}", automation_id);
        }
    }

    /// Number of live timers
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    fn arm_interval(&self, automation_id: &str, seconds: u64) {
        let id = automation_id.to_string();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(seconds));
            // Skip the first immediate tick
            interval.tick().await;

            loop {
                interval.tick().await;
                tracing::debug!("Interval timer fired for automation {}", id);
                let _ = event_tx.send(SchedulerEvent {
                    automation_id: id.clone(),
                });
            }
        });

        self.timers.insert(automation_id.to_string(), handle);
        tracing::info!(
            "Armed interval timer every {}s for automation {}",
            seconds,
            automation_id
        );
    }

    fn arm_cron(&self, automation_id: &str, expression: &str) -> Result<(), AutomationError> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| AutomationError::InvalidCron(format!("{expression}: {e}")))?;

        let id = automation_id.to_string();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                let now = Local::now();
                let Some(next_time) = schedule.upcoming(Local).next() else {
                    tracing::warn!("No upcoming instants for automation {}", id);
                    break;
                };

                let duration = (next_time - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(1));

                tracing::debug!(
                    "Next timer for {} at {} (in {:?})",
                    id,
                    next_time,
                    duration
                );

                tokio::time::sleep(duration).await;

                tracing::debug!("Timer fired for automation {}", id);
                let _ = event_tx.send(SchedulerEvent {
                    automation_id: id.clone(),
                });

                // Small delay to avoid double-firing on the same instant
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });

        self.timers.insert(automation_id.to_string(), handle);
        tracing::info!(
            "Armed cron timer '{}' for automation {}",
            expression,
            automation_id
        );
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, Automation, CreateAutomationRequest};

    fn time_automation(schedule: ScheduleSpec, enabled: bool) -> Automation {
        Automation::from_request(CreateAutomationRequest {
            name: "timed".into(),
            description: None,
            enabled,
            trigger: Trigger::Time { schedule },
            conditions: vec![],
            actions: vec![Action::Notify {
                message: "tick".into(),
            }],
        })
    }

    #[tokio::test]
    async fn rearming_never_leaves_two_timers() {
        let scheduler = Scheduler::new();
        let automation = time_automation(
            ScheduleSpec::Cron {
                expression: "0 0 8 * * *".into(),
            },
            true,
        );

        scheduler.arm(&automation).unwrap();
        scheduler.arm(&automation).unwrap();
        scheduler.arm(&automation).unwrap();

        assert_eq!(scheduler.active_count(), 1);
    }

    #[tokio::test]
    async fn disabled_automation_is_disarmed() {
        let scheduler = Scheduler::new();
        let mut automation = time_automation(
            ScheduleSpec::Cron {
                expression: "0 0 8 * * *".into(),
            },
            true,
        );

        scheduler.arm(&automation).unwrap();
        assert_eq!(scheduler.active_count(), 1);

        automation.enabled = false;
        scheduler.arm(&automation).unwrap();
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn trigger_change_away_from_time_disarms() {
        let scheduler = Scheduler::new();
        let mut automation = time_automation(
            ScheduleSpec::Interval { seconds: 60 },
            true,
        );
        scheduler.arm(&automation).unwrap();
        assert_eq!(scheduler.active_count(), 1);

        automation.trigger = Trigger::DeviceState {
            device_id: "d1".into(),
            property: "on".into(),
            operator: crate::model::TriggerOp::Equals,
            value: serde_json::json!(true),
        };
        scheduler.arm(&automation).unwrap();
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_timer_fires_and_recurs() {
        let scheduler = Scheduler::new();
        let mut rx = scheduler.subscribe();
        let automation = time_automation(ScheduleSpec::Interval { seconds: 60 }, true);
        scheduler.arm(&automation).unwrap();

        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.automation_id, automation.id);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_stops_firing() {
        let scheduler = Scheduler::new();
        let mut rx = scheduler.subscribe();
        let automation = time_automation(ScheduleSpec::Interval { seconds: 60 }, true);
        scheduler.arm(&automation).unwrap();

        rx.recv().await.unwrap();
        scheduler.disarm(&automation.id);

        let no_more =
            tokio::time::timeout(std::time::Duration::from_secs(300), rx.recv()).await;
        assert!(no_more.is_err(), "timer kept firing after disarm");
    }
}
