use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{ReminderId, ReminderKey, TaskId, UserId};

/// Payload carried by an OS wake registration and handed back when it fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub struct WakeEvent {
    pub reminder_id: ReminderId,
    pub task_id: TaskId,
    pub user_id: UserId,
}

impl WakeEvent {
    pub fn key(&self) -> ReminderKey {
        ReminderKey::new(self.user_id, self.reminder_id)
    }
}

pub type WakeSender = mpsc::UnboundedSender<WakeEvent>;
pub type WakeReceiver = mpsc::UnboundedReceiver<WakeEvent>;

/// Inbound port for fired wakes. Timers and boot recovery both feed it.
pub fn wake_channel() -> (WakeSender, WakeReceiver) {
    mpsc::unbounded_channel()
}
