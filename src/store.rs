use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;

use crate::models::{
    NewReminder, Reminder, ReminderId, ReminderKey, RemindersFile, TaskId, Timestamp, UserId,
};
use crate::storage::{Storage, StorageError, SCHEMA_VERSION};
use crate::tasks::TaskSource;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("constraint violation: task {task_id} of user {user_id} does not exist")]
    ConstraintViolation { task_id: TaskId, user_id: UserId },
    #[error("reminder {0} already exists")]
    DuplicateId(ReminderKey),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Snapshot = Arc<Vec<Reminder>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderStats {
    pub total: usize,
    pub active: usize,
    pub tasks_with_reminders: usize,
    pub tasks_with_duplicates: usize,
}

/// Durable reminder rows. Every mutation runs as one transaction: it is applied
/// to a copy, the copy is persisted, and only then does it become visible.
#[derive(Clone)]
pub struct ReminderStore {
    storage: Option<Storage>,
    rows: Arc<Mutex<Vec<Reminder>>>,
    updates: Arc<watch::Sender<Snapshot>>,
}

impl ReminderStore {
    pub fn open(storage: Storage) -> Result<Self, StoreError> {
        storage.ensure_dirs()?;
        let file = storage.load_reminders()?;
        log::info!(
            "reminder store opened dir={} rows={}",
            storage.root().display(),
            file.reminders.len()
        );
        Ok(Self::with_rows(Some(storage), file.reminders))
    }

    /// Non-durable store; the process-restart story does not apply.
    pub fn in_memory() -> Self {
        Self::with_rows(None, Vec::new())
    }

    fn with_rows(storage: Option<Storage>, rows: Vec<Reminder>) -> Self {
        let (updates, _) = watch::channel(Arc::new(rows.clone()));
        Self {
            storage,
            rows: Arc::new(Mutex::new(rows)),
            updates: Arc::new(updates),
        }
    }

    /// Latest committed rows. A fresh receiver always starts at the current
    /// snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    pub fn insert(
        &self,
        new: NewReminder,
        tasks: &dyn TaskSource,
        now: Timestamp,
    ) -> Result<Reminder, StoreError> {
        ensure_task_exists(&new, tasks)?;
        self.transact(false, |rows| push_row(rows, new, now))
    }

    /// Deactivates every active reminder of the task and inserts the new one in
    /// the same transaction. Returns the new row and the superseded rows.
    pub fn replace_active(
        &self,
        new: NewReminder,
        tasks: &dyn TaskSource,
        now: Timestamp,
    ) -> Result<(Reminder, Vec<Reminder>), StoreError> {
        ensure_task_exists(&new, tasks)?;
        self.transact(false, |rows| {
            let mut superseded = Vec::new();
            for row in rows.iter_mut() {
                if row.active && row.task_id == new.task_id && row.user_id == new.user_id {
                    row.active = false;
                    row.updated_at = now;
                    superseded.push(row.clone());
                }
            }
            let inserted = push_row(rows, new, now)?;
            Ok((inserted, superseded))
        })
    }

    pub fn get(&self, key: ReminderKey) -> Option<Reminder> {
        let guard = self.rows.lock().expect("reminder store poisoned");
        guard.iter().find(|row| row.key() == key).cloned()
    }

    /// Active reminders of one task, earliest fire time first.
    pub fn list_active(&self, task_id: TaskId, user_id: UserId) -> Vec<Reminder> {
        let mut out =
            self.select(|row| row.active && row.task_id == task_id && row.user_id == user_id);
        out.sort_by_key(|row| (row.fire_at, row.id));
        out
    }

    /// Every row of the task, active or not, in id order.
    pub fn list_by_task(&self, task_id: TaskId) -> Vec<Reminder> {
        let mut out = self.select(|row| row.task_id == task_id);
        out.sort_by_key(|row| (row.user_id, row.id));
        out
    }

    pub fn list_all_active(&self) -> Vec<Reminder> {
        let mut out = self.select(|row| row.active);
        out.sort_by_key(|row| (row.fire_at, row.user_id, row.id));
        out
    }

    /// Returns the row as it is after the call, `None` if it does not exist.
    /// Deactivating an inactive row does not write.
    pub fn deactivate(
        &self,
        key: ReminderKey,
        now: Timestamp,
    ) -> Result<Option<Reminder>, StoreError> {
        match self.get(key) {
            None => return Ok(None),
            Some(row) if !row.active => return Ok(Some(row)),
            Some(_) => {}
        }
        self.transact(false, |rows| {
            Ok(rows.iter_mut().find(|row| row.key() == key).map(|row| {
                row.active = false;
                row.updated_at = now;
                row.clone()
            }))
        })
    }

    pub fn mark_delivered(
        &self,
        key: ReminderKey,
        now: Timestamp,
    ) -> Result<Option<Reminder>, StoreError> {
        self.transact(false, |rows| {
            Ok(rows.iter_mut().find(|row| row.key() == key).map(|row| {
                // A timer that fires a tick early must still count as delivered.
                row.delivered_at = Some(now.max(row.fire_at));
                row.updated_at = now;
                row.clone()
            }))
        })
    }

    /// Cascade for a deleted task. Returns the removed rows.
    pub fn delete_for_task(
        &self,
        task_id: TaskId,
        user_id: UserId,
    ) -> Result<Vec<Reminder>, StoreError> {
        self.transact(false, |rows| {
            let (removed, kept): (Vec<_>, Vec<_>) = rows
                .drain(..)
                .partition(|row| row.task_id == task_id && row.user_id == user_id);
            *rows = kept;
            Ok(removed)
        })
    }

    /// Keeps only the highest id per `(task, user)` group and returns the
    /// removed rows. The previous file is backed up when anything is removed.
    /// Running it again on a compacted store removes nothing.
    pub fn compact(&self) -> Result<Vec<Reminder>, StoreError> {
        let has_duplicates = {
            let guard = self.rows.lock().expect("reminder store poisoned");
            max_id_per_task(&guard).len() != guard.len()
        };
        if !has_duplicates {
            return Ok(Vec::new());
        }
        self.transact(true, |rows| {
            let mut keep = max_id_per_task(rows);
            let mut removed = Vec::new();
            // `remove` makes a second row carrying the same max id lose too.
            rows.retain(|row| {
                let group = (row.task_id, row.user_id);
                if keep.get(&group) == Some(&row.id) {
                    keep.remove(&group);
                    return true;
                }
                removed.push(row.clone());
                false
            });
            Ok(removed)
        })
    }

    pub fn stats(&self) -> ReminderStats {
        let guard = self.rows.lock().expect("reminder store poisoned");
        let mut per_task: BTreeMap<(TaskId, UserId), usize> = BTreeMap::new();
        for row in guard.iter() {
            *per_task.entry((row.task_id, row.user_id)).or_default() += 1;
        }
        ReminderStats {
            total: guard.len(),
            active: guard.iter().filter(|row| row.active).count(),
            tasks_with_reminders: per_task.len(),
            tasks_with_duplicates: per_task.values().filter(|count| **count > 1).count(),
        }
    }

    fn select(&self, predicate: impl Fn(&Reminder) -> bool) -> Vec<Reminder> {
        let guard = self.rows.lock().expect("reminder store poisoned");
        guard.iter().filter(|row| predicate(row)).cloned().collect()
    }

    fn transact<T>(
        &self,
        with_backup: bool,
        apply: impl FnOnce(&mut Vec<Reminder>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.rows.lock().expect("reminder store poisoned");
        let mut next = guard.clone();
        let out = apply(&mut next)?;
        if let Some(storage) = &self.storage {
            let file = RemindersFile {
                schema_version: SCHEMA_VERSION,
                reminders: next.clone(),
            };
            storage.save_reminders(&file, with_backup)?;
        }
        *guard = next;
        self.updates.send_replace(Arc::new(guard.clone()));
        Ok(out)
    }
}

fn ensure_task_exists(new: &NewReminder, tasks: &dyn TaskSource) -> Result<(), StoreError> {
    if tasks.get_task(new.user_id, new.task_id).is_none() {
        return Err(StoreError::ConstraintViolation {
            task_id: new.task_id,
            user_id: new.user_id,
        });
    }
    Ok(())
}

fn next_id_for_user(rows: &[Reminder], user_id: UserId) -> ReminderId {
    rows.iter()
        .filter(|row| row.user_id == user_id)
        .map(|row| row.id)
        .max()
        .unwrap_or(0)
        + 1
}

fn push_row(
    rows: &mut Vec<Reminder>,
    new: NewReminder,
    now: Timestamp,
) -> Result<Reminder, StoreError> {
    let id = match new.id {
        Some(id) => {
            let key = ReminderKey::new(new.user_id, id);
            if rows.iter().any(|row| row.key() == key) {
                return Err(StoreError::DuplicateId(key));
            }
            id
        }
        None => next_id_for_user(rows, new.user_id),
    };
    let row = Reminder {
        id,
        task_id: new.task_id,
        user_id: new.user_id,
        fire_at: new.fire_at,
        kind: new.kind,
        active: true,
        created_at: now,
        updated_at: now,
        delivered_at: None,
    };
    rows.push(row.clone());
    Ok(row)
}

fn max_id_per_task(rows: &[Reminder]) -> BTreeMap<(TaskId, UserId), ReminderId> {
    let mut keep: BTreeMap<(TaskId, UserId), ReminderId> = BTreeMap::new();
    for row in rows {
        let entry = keep.entry((row.task_id, row.user_id)).or_insert(row.id);
        if row.id > *entry {
            *entry = row.id;
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReminderKind, Task, TaskStatus};
    use crate::tasks::TaskBook;

    fn make_task(user_id: UserId, id: TaskId) -> Task {
        Task {
            id,
            user_id,
            title: format!("task-{id}"),
            description: None,
            due_at: None,
            status: TaskStatus::Pending,
        }
    }

    fn new_reminder(user_id: UserId, task_id: TaskId, fire_at: Timestamp) -> NewReminder {
        NewReminder {
            id: None,
            task_id,
            user_id,
            fire_at,
            kind: ReminderKind::AtTime,
        }
    }

    fn with_id(mut new: NewReminder, id: ReminderId) -> NewReminder {
        new.id = Some(id);
        new
    }

    #[test]
    fn insert_assigns_ids_per_user() {
        let tasks = TaskBook::new(vec![make_task(1, 42), make_task(2, 7)]);
        let store = ReminderStore::in_memory();

        let a = store.insert(new_reminder(1, 42, 100), &tasks, 1).unwrap();
        let b = store.insert(new_reminder(1, 42, 200), &tasks, 1).unwrap();
        let c = store.insert(new_reminder(2, 7, 300), &tasks, 1).unwrap();
        assert_eq!((a.id, b.id, c.id), (1, 2, 1));
        assert!(a.active);
        assert_eq!(a.created_at, 1);
        assert_eq!(a.delivered_at, None);
    }

    #[test]
    fn insert_for_missing_task_is_a_constraint_violation() {
        let tasks = TaskBook::default();
        let store = ReminderStore::in_memory();
        let err = store.insert(new_reminder(1, 42, 100), &tasks, 1).unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConstraintViolation {
                task_id: 42,
                user_id: 1
            }
        ));
        assert_eq!(store.stats().total, 0);
    }

    #[test]
    fn explicit_id_must_be_unique_per_user() {
        let tasks = TaskBook::new(vec![make_task(1, 42), make_task(2, 42)]);
        let store = ReminderStore::in_memory();
        store.insert(with_id(new_reminder(1, 42, 1), 9), &tasks, 1).unwrap();
        // Same id for another user is fine.
        store.insert(with_id(new_reminder(2, 42, 1), 9), &tasks, 1).unwrap();
        let err = store
            .insert(with_id(new_reminder(1, 42, 1), 9), &tasks, 1)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(key) if key == ReminderKey::new(1, 9)));
        // Next generated id follows the explicit one.
        let next = store.insert(new_reminder(1, 42, 1), &tasks, 1).unwrap();
        assert_eq!(next.id, 10);
    }

    #[test]
    fn list_queries_filter_and_order() {
        let tasks = TaskBook::new(vec![make_task(1, 42), make_task(1, 43), make_task(2, 42)]);
        let store = ReminderStore::in_memory();
        store.insert(new_reminder(1, 42, 300), &tasks, 1).unwrap();
        store.insert(new_reminder(1, 42, 100), &tasks, 1).unwrap();
        store.insert(new_reminder(1, 43, 200), &tasks, 1).unwrap();
        store.insert(new_reminder(2, 42, 50), &tasks, 1).unwrap();
        store.deactivate(ReminderKey::new(1, 3), 2).unwrap();

        let active: Vec<_> = store.list_active(42, 1).iter().map(|r| r.fire_at).collect();
        assert_eq!(active, vec![100, 300]);

        // By task id only, across users, inactive included.
        assert_eq!(store.list_by_task(42).len(), 3);
        assert_eq!(store.list_by_task(43).len(), 1);
        assert!(!store.list_by_task(43)[0].active);

        let all: Vec<_> = store.list_all_active().iter().map(|r| r.fire_at).collect();
        assert_eq!(all, vec![50, 100, 300]);
    }

    #[test]
    fn replace_active_supersedes_previous_rows_atomically() {
        let tasks = TaskBook::new(vec![make_task(1, 42)]);
        let store = ReminderStore::in_memory();
        store.insert(new_reminder(1, 42, 100), &tasks, 1).unwrap();
        store.insert(new_reminder(1, 42, 200), &tasks, 1).unwrap();

        let (inserted, superseded) = store
            .replace_active(new_reminder(1, 42, 300), &tasks, 5)
            .unwrap();
        assert_eq!(inserted.id, 3);
        assert_eq!(superseded.len(), 2);
        assert!(superseded.iter().all(|row| !row.active && row.updated_at == 5));
        assert_eq!(store.list_active(42, 1), vec![inserted]);

        // A failing replace leaves everything untouched.
        assert!(store
            .replace_active(new_reminder(1, 99, 300), &tasks, 6)
            .is_err());
        assert_eq!(store.list_active(42, 1).len(), 1);
    }

    #[test]
    fn deactivate_and_mark_delivered() {
        let tasks = TaskBook::new(vec![make_task(1, 42)]);
        let store = ReminderStore::in_memory();
        let row = store.insert(new_reminder(1, 42, 100), &tasks, 1).unwrap();

        let delivered = store.mark_delivered(row.key(), 100).unwrap().unwrap();
        assert!(delivered.is_delivered());
        assert!(delivered.active);

        let off = store.deactivate(row.key(), 120).unwrap().unwrap();
        assert!(!off.active);
        assert_eq!(off.updated_at, 120);
        // Second call is a no-op that keeps the first timestamp.
        let again = store.deactivate(row.key(), 999).unwrap().unwrap();
        assert_eq!(again.updated_at, 120);

        assert!(store.deactivate(ReminderKey::new(1, 77), 1).unwrap().is_none());
        assert!(store.mark_delivered(ReminderKey::new(1, 77), 1).unwrap().is_none());
    }

    #[test]
    fn compaction_keeps_highest_id_per_task() {
        let tasks = TaskBook::new(vec![make_task(1, 42), make_task(1, 43)]);
        let store = ReminderStore::in_memory();
        for id in [5, 7, 9] {
            store.insert(with_id(new_reminder(1, 42, 100), id), &tasks, 1).unwrap();
        }
        store.insert(with_id(new_reminder(1, 43, 100), 2), &tasks, 1).unwrap();
        assert_eq!(store.stats().tasks_with_duplicates, 1);

        let removed: Vec<_> = store.compact().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(removed, vec![5, 7]);

        let left: Vec<_> = store.list_by_task(42).iter().map(|r| r.id).collect();
        assert_eq!(left, vec![9]);
        assert!(store.get(ReminderKey::new(1, 9)).unwrap().active);
        assert_eq!(store.list_by_task(43).len(), 1);

        // Idempotent.
        assert!(store.compact().unwrap().is_empty());
        assert_eq!(
            store.stats(),
            ReminderStats {
                total: 2,
                active: 2,
                tasks_with_reminders: 2,
                tasks_with_duplicates: 0,
            }
        );
    }

    #[test]
    fn delete_for_task_only_touches_that_user() {
        let tasks = TaskBook::new(vec![make_task(1, 42), make_task(2, 42)]);
        let store = ReminderStore::in_memory();
        store.insert(new_reminder(1, 42, 1), &tasks, 1).unwrap();
        store.insert(new_reminder(1, 42, 2), &tasks, 1).unwrap();
        store.insert(new_reminder(2, 42, 3), &tasks, 1).unwrap();

        let removed = store.delete_for_task(42, 1).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.list_by_task(42).len(), 1);
        assert_eq!(store.list_by_task(42)[0].user_id, 2);
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = TaskBook::new(vec![make_task(1, 42)]);
        {
            let store = ReminderStore::open(Storage::new(dir.path().to_path_buf())).unwrap();
            store.insert(new_reminder(1, 42, 100), &tasks, 1).unwrap();
            store.insert(new_reminder(1, 42, 200), &tasks, 1).unwrap();
            store.compact().unwrap();
        }
        let store = ReminderStore::open(Storage::new(dir.path().to_path_buf())).unwrap();
        let rows = store.list_all_active();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 2);
        let storage = Storage::new(dir.path().to_path_buf());
        assert_eq!(storage.list_backups().unwrap().len(), 1);
    }

    #[test]
    fn failed_persist_rolls_back_the_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = TaskBook::new(vec![make_task(1, 42)]);
        let store = ReminderStore::open(Storage::new(dir.path().to_path_buf())).unwrap();
        store.insert(new_reminder(1, 42, 100), &tasks, 1).unwrap();

        // A directory where the file should be makes the final rename fail.
        std::fs::remove_file(dir.path().join("reminders.json")).unwrap();
        std::fs::create_dir(dir.path().join("reminders.json")).unwrap();

        let err = store.insert(new_reminder(1, 42, 200), &tasks, 2).unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
        assert_eq!(store.stats().total, 1);
        assert!(store.get(ReminderKey::new(1, 2)).is_none());
    }

    #[test]
    fn subscribers_see_committed_snapshots() {
        let tasks = TaskBook::new(vec![make_task(1, 42)]);
        let store = ReminderStore::in_memory();
        let mut rx = store.subscribe();
        assert!(rx.borrow().is_empty());

        store.insert(new_reminder(1, 42, 100), &tasks, 1).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);

        // Late subscribers start from the current snapshot.
        let late = store.subscribe();
        assert_eq!(late.borrow().len(), 1);
    }
}
