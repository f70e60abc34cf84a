use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::events::WakeEvent;
use crate::models::{Reminder, ReminderKey, Task};
use crate::platform::{AlarmPlatform, PlatformError, Precision, Registration};
use crate::store::ReminderStore;
use crate::tasks::TaskSource;

/// How a wake request was accepted.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    Exact,
    /// Accepted without exact timing because the permission is missing. The
    /// caller may ask the user to grant it.
    Degraded,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub cancelled: Vec<ReminderKey>,
    pub scheduled: usize,
    pub degraded: usize,
    pub failed: Vec<ReminderKey>,
}

/// Keeps OS wake registrations in one-to-one correspondence with pending
/// reminder rows.
#[derive(Clone)]
pub struct AlarmScheduler {
    platform: Arc<dyn AlarmPlatform>,
    allow_inexact: bool,
}

impl AlarmScheduler {
    pub fn new(platform: Arc<dyn AlarmPlatform>, allow_inexact: bool) -> Self {
        Self {
            platform,
            allow_inexact,
        }
    }

    /// Registers a one-shot wake at `reminder.fire_at`, keyed by the reminder.
    /// Callers cancel the previous reminder of the task first.
    pub fn schedule(&self, task: &Task, reminder: &Reminder) -> Result<Scheduling, PlatformError> {
        let key = reminder.key();
        let payload = WakeEvent {
            reminder_id: reminder.id,
            task_id: task.id,
            user_id: task.user_id,
        };
        let registration = |precision| Registration {
            key,
            at: reminder.fire_at,
            precision,
            payload,
        };

        if self.platform.can_schedule_exact() {
            match self.platform.register(registration(Precision::Exact)) {
                Ok(()) => {
                    log::debug!("alarm: scheduled exact reminder={key} at={}", reminder.fire_at);
                    return Ok(Scheduling::Exact);
                }
                // Permission revoked between the check and the call.
                Err(PlatformError::ExactDenied) => {}
                Err(err) => return Err(err),
            }
        }
        if !self.allow_inexact {
            log::warn!("alarm: exact wakes denied, inexact fallback disabled reminder={key}");
            return Err(PlatformError::ExactDenied);
        }
        self.platform.register(registration(Precision::Inexact))?;
        log::warn!(
            "alarm: exact wakes denied, scheduled inexact reminder={key} at={}",
            reminder.fire_at
        );
        Ok(Scheduling::Degraded)
    }

    /// Safe to call speculatively.
    pub fn cancel(&self, key: ReminderKey) -> bool {
        let removed = self.platform.cancel(key);
        if removed {
            log::debug!("alarm: cancelled reminder={key}");
        }
        removed
    }

    pub fn can_schedule_exact(&self) -> bool {
        self.platform.can_schedule_exact()
    }

    pub fn registered(&self) -> Vec<Registration> {
        self.platform.registrations()
    }

    /// Makes the registrations equal the pending rows whose task is still
    /// open: orphans are cancelled, missing or stale ones (re)registered.
    pub fn reconcile(&self, store: &ReminderStore, tasks: &dyn TaskSource) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let desired: BTreeMap<ReminderKey, (Task, Reminder)> = store
            .list_all_active()
            .into_iter()
            .filter(Reminder::is_pending)
            .filter_map(|reminder| {
                let task = tasks.get_task(reminder.user_id, reminder.task_id)?;
                if task.status.is_closed() {
                    return None;
                }
                Some((reminder.key(), (task, reminder)))
            })
            .collect();
        let current: BTreeMap<ReminderKey, Registration> = self
            .platform
            .registrations()
            .into_iter()
            .map(|registration| (registration.key, registration))
            .collect();

        for key in current.keys() {
            if !desired.contains_key(key) && self.cancel(*key) {
                report.cancelled.push(*key);
            }
        }
        for (key, (task, reminder)) in &desired {
            let up_to_date = current
                .get(key)
                .is_some_and(|registration| registration.at == reminder.fire_at);
            if up_to_date {
                continue;
            }
            match self.schedule(task, reminder) {
                Ok(Scheduling::Exact) => report.scheduled += 1,
                Ok(Scheduling::Degraded) => {
                    report.scheduled += 1;
                    report.degraded += 1;
                }
                Err(err) => {
                    log::warn!("alarm: reconcile failed reminder={key}: {err}");
                    report.failed.push(*key);
                }
            }
        }
        log::info!(
            "alarm: reconciled cancelled={} scheduled={} degraded={} failed={}",
            report.cancelled.len(),
            report.scheduled,
            report.degraded,
            report.failed.len()
        );
        report
    }
}
