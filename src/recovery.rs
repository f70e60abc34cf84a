use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::compactor::Compactor;
use crate::events::{WakeEvent, WakeSender};
use crate::models::ReminderKey;
use crate::scheduler::{AlarmScheduler, Scheduling};
use crate::store::ReminderStore;
use crate::tasks::TaskSource;

/// One reminder that could not be restored. Never aborts the pass.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecoveryFailure {
    pub reminder: ReminderKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RecoveryReport {
    pub compacted: usize,
    pub scheduled: usize,
    pub degraded: usize,
    /// Fire time passed while the process was down; handed straight to delivery.
    pub enqueued: Vec<WakeEvent>,
    /// Already delivered and waiting for the user to stop or snooze.
    pub awaiting_ack: usize,
    pub failures: Vec<RecoveryFailure>,
}

/// Re-derives every wake registration from the store after a restart. The
/// store is the only thing that survives one.
pub struct BootRecoveryCoordinator {
    store: ReminderStore,
    tasks: Arc<dyn TaskSource>,
    scheduler: AlarmScheduler,
    clock: Arc<dyn Clock>,
    wakes: WakeSender,
}

impl BootRecoveryCoordinator {
    pub fn new(
        store: ReminderStore,
        tasks: Arc<dyn TaskSource>,
        scheduler: AlarmScheduler,
        clock: Arc<dyn Clock>,
        wakes: WakeSender,
    ) -> Self {
        Self {
            store,
            tasks,
            scheduler,
            clock,
            wakes,
        }
    }

    pub fn run(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        match Compactor::new(self.store.clone()).run() {
            Ok(compaction) => report.compacted = compaction.removed.len(),
            Err(err) => log::error!("recovery: compaction failed, continuing: {err}"),
        }

        let now = self.clock.now();
        for reminder in self.store.list_all_active() {
            let key = reminder.key();
            if reminder.is_delivered() {
                report.awaiting_ack += 1;
                continue;
            }
            let Some(task) = self.tasks.get_task(reminder.user_id, reminder.task_id) else {
                log::warn!(
                    "recovery: skipped reminder={key}, task {} not found",
                    reminder.task_id
                );
                report.failures.push(RecoveryFailure {
                    reminder: key,
                    reason: "task not found".to_string(),
                });
                continue;
            };
            if task.status.is_closed() {
                if let Err(err) = self.store.deactivate(key, now) {
                    log::warn!("recovery: could not deactivate reminder={key}: {err}");
                }
                report.failures.push(RecoveryFailure {
                    reminder: key,
                    reason: "task closed".to_string(),
                });
                continue;
            }

            if reminder.fire_at > now {
                match self.scheduler.schedule(&task, &reminder) {
                    Ok(Scheduling::Exact) => report.scheduled += 1,
                    Ok(Scheduling::Degraded) => {
                        report.scheduled += 1;
                        report.degraded += 1;
                    }
                    Err(err) => {
                        log::warn!("recovery: could not register reminder={key}: {err}");
                        report.failures.push(RecoveryFailure {
                            reminder: key,
                            reason: err.to_string(),
                        });
                    }
                }
                continue;
            }

            let event = WakeEvent {
                reminder_id: reminder.id,
                task_id: task.id,
                user_id: task.user_id,
            };
            if self.wakes.send(event).is_err() {
                log::warn!("recovery: wake channel closed, reminder={key} not enqueued");
                report.failures.push(RecoveryFailure {
                    reminder: key,
                    reason: "wake channel closed".to_string(),
                });
                continue;
            }
            log::info!(
                "recovery: reminder={key} elapsed during downtime (fire_at={}), delivering now",
                reminder.fire_at
            );
            report.enqueued.push(event);
        }

        log::info!(
            "recovery: compacted={} scheduled={} degraded={} enqueued={} awaiting_ack={} failures={}",
            report.compacted,
            report.scheduled,
            report.degraded,
            report.enqueued.len(),
            report.awaiting_ack,
            report.failures.len()
        );
        report
    }
}
