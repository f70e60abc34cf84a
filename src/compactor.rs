use serde::Serialize;

use crate::models::ReminderKey;
use crate::store::{ReminderStats, ReminderStore, StoreError};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CompactionReport {
    pub before: ReminderStats,
    pub after: ReminderStats,
    pub removed: Vec<ReminderKey>,
}

/// Collapses duplicate reminder rows to the most recent one per task.
///
/// Only the store is touched. Registrations for removed rows are left for
/// [`crate::scheduler::AlarmScheduler::reconcile`] to clean up.
#[derive(Clone)]
pub struct Compactor {
    store: ReminderStore,
}

impl Compactor {
    pub fn new(store: ReminderStore) -> Self {
        Self { store }
    }

    pub fn run(&self) -> Result<CompactionReport, StoreError> {
        let before = self.store.stats();
        log::debug!(
            "compaction: start total={} tasks={} duplicated_tasks={}",
            before.total,
            before.tasks_with_reminders,
            before.tasks_with_duplicates
        );
        let removed: Vec<ReminderKey> = self
            .store
            .compact()?
            .iter()
            .map(|row| row.key())
            .collect();
        let after = self.store.stats();
        if removed.is_empty() {
            log::debug!("compaction: no duplicate reminders");
        } else {
            log::info!(
                "compaction: removed={} total_before={} total_after={}",
                removed.len(),
                before.total,
                after.total
            );
        }
        Ok(CompactionReport {
            before,
            after,
            removed,
        })
    }
}
