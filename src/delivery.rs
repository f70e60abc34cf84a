use std::sync::Arc;

use serde::Serialize;

use crate::alert::{Alert, AlertLabels, AlertSurface};
use crate::clock::Clock;
use crate::events::{WakeEvent, WakeReceiver};
use crate::models::ReminderKey;
use crate::store::ReminderStore;
use crate::tasks::TaskSource;

/// Why a firing ended without an alert.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DropReason {
    TaskMissing,
    TaskClosed,
    ReminderGone,
    ReminderInactive,
    /// The registration payload names another task than the row it points at.
    StalePayload,
    AlertUnavailable(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WakeOutcome {
    Delivered { alert: Alert, foreground: bool },
    Dropped { reason: DropReason },
    /// The reminder was already delivered; nothing was posted again.
    Duplicate,
}

impl WakeOutcome {
    fn dropped(reason: DropReason) -> Self {
        WakeOutcome::Dropped { reason }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, WakeOutcome::Delivered { .. })
    }
}

/// Runs when a registered wake fires. Holds no state between invocations:
/// everything is re-read from the task source and the reminder store, so it
/// is safe under at-least-once delivery.
#[derive(Clone)]
pub struct WakeDeliveryHandler {
    store: ReminderStore,
    tasks: Arc<dyn TaskSource>,
    surface: Arc<dyn AlertSurface>,
    clock: Arc<dyn Clock>,
    labels: AlertLabels,
    snooze_minutes: u32,
}

impl WakeDeliveryHandler {
    pub fn new(
        store: ReminderStore,
        tasks: Arc<dyn TaskSource>,
        surface: Arc<dyn AlertSurface>,
        clock: Arc<dyn Clock>,
        labels: AlertLabels,
        snooze_minutes: u32,
    ) -> Self {
        Self {
            store,
            tasks,
            surface,
            clock,
            labels,
            snooze_minutes,
        }
    }

    pub fn handle(&self, event: WakeEvent) -> WakeOutcome {
        let key = event.key();
        log::debug!(
            "delivery: wake reminder={key} task={} user={}",
            event.task_id,
            event.user_id
        );

        // The row is read first: ids are reused after a cascade delete, so the
        // key alone may now name another task's reminder.
        let Some(reminder) = self.store.get(key) else {
            log::info!("delivery: dropped reminder={key}, row no longer exists");
            return WakeOutcome::dropped(DropReason::ReminderGone);
        };
        if reminder.task_id != event.task_id {
            log::warn!(
                "delivery: dropped reminder={key}, payload task {} but row task {}",
                event.task_id,
                reminder.task_id
            );
            return WakeOutcome::dropped(DropReason::StalePayload);
        }

        let Some(task) = self.tasks.get_task(event.user_id, event.task_id) else {
            log::info!(
                "delivery: dropped reminder={key}, task {} of user {} no longer exists",
                event.task_id,
                event.user_id
            );
            self.retire(key);
            return WakeOutcome::dropped(DropReason::TaskMissing);
        };
        if task.status.is_closed() {
            log::info!("delivery: dropped reminder={key}, task {} is closed", task.id);
            self.retire(key);
            return WakeOutcome::dropped(DropReason::TaskClosed);
        }

        if !reminder.active {
            log::debug!("delivery: reminder={key} inactive, ignoring wake");
            return WakeOutcome::dropped(DropReason::ReminderInactive);
        }
        if reminder.is_delivered() {
            log::debug!("delivery: reminder={key} already delivered, ignoring wake");
            return WakeOutcome::Duplicate;
        }

        let alert = Alert::build(&task, &reminder, &self.labels, self.snooze_minutes);
        if let Err(err) = self.surface.post_persistent(&alert) {
            log::error!("delivery: dropped reminder={key}, persistent alert failed: {err}");
            return WakeOutcome::dropped(DropReason::AlertUnavailable(err.to_string()));
        }
        let foreground = match self.surface.bring_to_foreground(&alert) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("delivery: foreground launch failed reminder={key}: {err}");
                false
            }
        };
        if let Err(err) = self.store.mark_delivered(key, self.clock.now()) {
            log::error!("delivery: could not record delivery reminder={key}: {err}");
        }
        log::info!("delivery: delivered reminder={key} task={}", task.id);
        WakeOutcome::Delivered { alert, foreground }
    }

    /// Deactivates a reminder whose firing can never succeed.
    fn retire(&self, key: ReminderKey) {
        if let Err(err) = self.store.deactivate(key, self.clock.now()) {
            log::warn!("delivery: could not deactivate reminder={key}: {err}");
        }
    }
}

/// Drains the wake channel until every sender is gone. Each firing runs on the
/// blocking pool; a panic there is logged and does not stop the worker.
pub async fn run_delivery_worker(handler: WakeDeliveryHandler, mut wakes: WakeReceiver) {
    while let Some(event) = wakes.recv().await {
        let key = event.key();
        let handler = handler.clone();
        match tokio::task::spawn_blocking(move || handler.handle(event)).await {
            Ok(outcome) => log::debug!("delivery: reminder={key} outcome={outcome:?}"),
            Err(err) => log::error!("delivery: handler crashed reminder={key}: {err}"),
        }
    }
    log::info!("delivery: wake channel closed, worker exiting");
}
