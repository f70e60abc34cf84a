use std::sync::Arc;

use serde::Serialize;

use crate::alert::{AlertLabels, AlertSurface};
use crate::clock::Clock;
use crate::compactor::{CompactionReport, Compactor};
use crate::delivery::{WakeDeliveryHandler, WakeOutcome};
use crate::events::{WakeEvent, WakeSender};
use crate::models::{
    NewReminder, Reminder, ReminderKey, ReminderKind, ReminderOffset, Settings, Task, TaskId,
    Timestamp, UserId,
};
use crate::platform::{AlarmPlatform, PlatformError, Registration};
use crate::recovery::{BootRecoveryCoordinator, RecoveryReport};
use crate::scheduler::{AlarmScheduler, ReconcileReport, Scheduling};
use crate::store::{ReminderStats, ReminderStore, StoreError};
use crate::tasks::TaskSource;

#[derive(Debug, thiserror::Error)]
pub enum ReminderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("task {task_id} of user {user_id} not found")]
    TaskNotFound { task_id: TaskId, user_id: UserId },
    #[error("task {0} is closed")]
    TaskClosed(TaskId),
    #[error("task {0} has no due time to count back from")]
    NoDueTime(TaskId),
    #[error("reminder time for task {0} is out of range")]
    FireTimeOutOfRange(TaskId),
    #[error("reminder {0} not found")]
    ReminderNotFound(ReminderKey),
    #[error("reminder {0} is no longer active")]
    ReminderInactive(ReminderKey),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduledReminder {
    pub reminder: Reminder,
    pub scheduling: Scheduling,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub compaction: CompactionReport,
    pub reconcile: ReconcileReport,
}

/// Everything the reminder core offers to the rest of the app. Built once at
/// startup and shared by handle.
pub struct ReminderService {
    store: ReminderStore,
    tasks: Arc<dyn TaskSource>,
    scheduler: AlarmScheduler,
    handler: WakeDeliveryHandler,
    clock: Arc<dyn Clock>,
    settings: Settings,
    wakes: WakeSender,
}

impl ReminderService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ReminderStore,
        tasks: Arc<dyn TaskSource>,
        platform: Arc<dyn AlarmPlatform>,
        surface: Arc<dyn AlertSurface>,
        clock: Arc<dyn Clock>,
        settings: Settings,
        labels: AlertLabels,
        wakes: WakeSender,
    ) -> Self {
        let scheduler = AlarmScheduler::new(platform, settings.allow_inexact);
        let handler = WakeDeliveryHandler::new(
            store.clone(),
            Arc::clone(&tasks),
            surface,
            Arc::clone(&clock),
            labels,
            settings.snooze_minutes,
        );
        Self {
            store,
            tasks,
            scheduler,
            handler,
            clock,
            settings,
            wakes,
        }
    }

    pub fn delivery_handler(&self) -> WakeDeliveryHandler {
        self.handler.clone()
    }

    pub fn store(&self) -> &ReminderStore {
        &self.store
    }

    /// False means new reminders will be scheduled inexactly; the UI may want
    /// to ask the user for the permission.
    pub fn exact_permission_granted(&self) -> bool {
        self.scheduler.can_schedule_exact()
    }

    /// Sets the task's reminder, superseding whatever reminder it had.
    pub fn create_or_replace_reminder(
        &self,
        user_id: UserId,
        task_id: TaskId,
        offset: ReminderOffset,
    ) -> Result<ScheduledReminder, ReminderError> {
        let task = self.open_task(user_id, task_id)?;
        let fire_at = offset.resolve(task.due_at).ok_or(match task.due_at {
            None => ReminderError::NoDueTime(task.id),
            Some(_) => ReminderError::FireTimeOutOfRange(task.id),
        })?;
        self.replace(&task, fire_at, offset.kind())
    }

    pub fn cancel_reminder(&self, key: ReminderKey) -> Result<Reminder, ReminderError> {
        let reminder = self
            .store
            .deactivate(key, self.clock.now())?
            .ok_or(ReminderError::ReminderNotFound(key))?;
        self.scheduler.cancel(key);
        log::info!("service: cancelled reminder={key}");
        Ok(reminder)
    }

    /// The alert's Stop control.
    pub fn stop(&self, key: ReminderKey) -> Result<Reminder, ReminderError> {
        self.cancel_reminder(key)
    }

    /// The alert's Snooze control: the fired reminder is superseded by a new
    /// one due after the configured snooze interval. A stopped or superseded
    /// reminder cannot be snoozed, so a stale alert never replaces a newer one.
    pub fn snooze(&self, key: ReminderKey) -> Result<ScheduledReminder, ReminderError> {
        let fired = self
            .store
            .get(key)
            .ok_or(ReminderError::ReminderNotFound(key))?;
        if !fired.active {
            return Err(ReminderError::ReminderInactive(key));
        }
        let task = self.open_task(fired.user_id, fired.task_id)?;
        let fire_at = self.clock.now().saturating_add(self.settings.snooze_ms());
        let scheduled = self.replace(&task, fire_at, ReminderKind::Snooze)?;
        log::info!(
            "service: snoozed reminder={key} as reminder={} until={fire_at}",
            scheduled.reminder.key()
        );
        Ok(scheduled)
    }

    pub fn list_reminders_for_task(&self, task_id: TaskId) -> Vec<Reminder> {
        self.store.list_by_task(task_id)
    }

    /// Must be called synchronously with the task's deletion.
    pub fn on_task_deleted(
        &self,
        task_id: TaskId,
        user_id: UserId,
    ) -> Result<Vec<Reminder>, ReminderError> {
        let removed = self.store.delete_for_task(task_id, user_id)?;
        for reminder in &removed {
            self.scheduler.cancel(reminder.key());
        }
        log::info!(
            "service: task {task_id} of user {user_id} deleted, removed {} reminders",
            removed.len()
        );
        Ok(removed)
    }

    /// Retires the active reminders of a task that was just completed or
    /// cancelled. A wake that races this is dropped by the handler anyway.
    pub fn on_task_closed(
        &self,
        task_id: TaskId,
        user_id: UserId,
    ) -> Result<Vec<Reminder>, ReminderError> {
        let mut retired = Vec::new();
        for reminder in self.store.list_active(task_id, user_id) {
            let key = reminder.key();
            if let Some(row) = self.store.deactivate(key, self.clock.now())? {
                retired.push(row);
            }
            self.scheduler.cancel(key);
        }
        if !retired.is_empty() {
            log::info!(
                "service: task {task_id} of user {user_id} closed, retired {} reminders",
                retired.len()
            );
        }
        Ok(retired)
    }

    /// On-demand compaction followed by a reconcile pass that drops the
    /// registrations of removed rows.
    pub fn compact(&self) -> Result<MaintenanceReport, ReminderError> {
        let compaction = Compactor::new(self.store.clone()).run()?;
        let reconcile = self.scheduler.reconcile(&self.store, self.tasks.as_ref());
        Ok(MaintenanceReport {
            compaction,
            reconcile,
        })
    }

    pub fn recover(&self) -> RecoveryReport {
        BootRecoveryCoordinator::new(
            self.store.clone(),
            Arc::clone(&self.tasks),
            self.scheduler.clone(),
            Arc::clone(&self.clock),
            self.wakes.clone(),
        )
        .run()
    }

    pub fn handle_wake(&self, event: WakeEvent) -> WakeOutcome {
        self.handler.handle(event)
    }

    pub fn stats(&self) -> ReminderStats {
        self.store.stats()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.scheduler.registered()
    }

    fn open_task(&self, user_id: UserId, task_id: TaskId) -> Result<Task, ReminderError> {
        let task = self
            .tasks
            .get_task(user_id, task_id)
            .ok_or(ReminderError::TaskNotFound { task_id, user_id })?;
        if task.status.is_closed() {
            return Err(ReminderError::TaskClosed(task.id));
        }
        Ok(task)
    }

    fn replace(
        &self,
        task: &Task,
        fire_at: Timestamp,
        kind: ReminderKind,
    ) -> Result<ScheduledReminder, ReminderError> {
        let (reminder, superseded) = self.store.replace_active(
            NewReminder::for_task(task, fire_at, kind),
            self.tasks.as_ref(),
            self.clock.now(),
        )?;
        for old in &superseded {
            self.scheduler.cancel(old.key());
        }
        // On failure the row stays active so a later reconcile or recovery
        // pass can register it.
        let scheduling = self.scheduler.schedule(task, &reminder)?;
        log::info!(
            "service: reminder={} task={} fire_at={fire_at} scheduling={scheduling:?} superseded={}",
            reminder.key(),
            task.id,
            superseded.len()
        );
        Ok(ScheduledReminder {
            reminder,
            scheduling,
        })
    }
}
