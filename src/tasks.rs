use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::models::{Task, TaskId, TasksFile, UserId};
use crate::storage::SCHEMA_VERSION;

/// The only thing the reminder core needs from the task store.
pub trait TaskSource: Send + Sync {
    fn get_task(&self, user_id: UserId, task_id: TaskId) -> Option<Task>;
}

/// In-process task table keyed by `(user_id, task_id)`.
#[derive(Clone, Default)]
pub struct TaskBook {
    inner: Arc<Mutex<BTreeMap<(UserId, TaskId), Task>>>,
}

impl TaskBook {
    pub fn new(tasks: Vec<Task>) -> Self {
        let map = tasks
            .into_iter()
            .map(|task| ((task.user_id, task.id), task))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    pub fn tasks(&self) -> Vec<Task> {
        let guard = self.inner.lock().expect("task book poisoned");
        guard.values().cloned().collect()
    }

    pub fn tasks_file(&self) -> TasksFile {
        TasksFile {
            schema_version: SCHEMA_VERSION,
            tasks: self.tasks(),
        }
    }

    /// Identity is immutable, so an upsert only ever replaces mutable fields.
    pub fn upsert(&self, task: Task) {
        let mut guard = self.inner.lock().expect("task book poisoned");
        guard.insert((task.user_id, task.id), task);
    }

    pub fn remove(&self, user_id: UserId, task_id: TaskId) -> Option<Task> {
        let mut guard = self.inner.lock().expect("task book poisoned");
        guard.remove(&(user_id, task_id))
    }
}

impl TaskSource for TaskBook {
    fn get_task(&self, user_id: UserId, task_id: TaskId) -> Option<Task> {
        let guard = self.inner.lock().expect("task book poisoned");
        guard.get(&(user_id, task_id)).cloned()
    }
}
