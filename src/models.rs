use serde::{Deserialize, Serialize};

/// Epoch milliseconds. The only instant representation stored or passed around.
pub type Timestamp = i64;
pub type UserId = i64;
pub type TaskId = i64;
pub type ReminderId = i64;

pub const MINUTE_MS: i64 = 60 * 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Overdue,
}

impl TaskStatus {
    /// Completed and cancelled tasks never fire reminders.
    pub fn is_closed(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

/// A task as seen by the reminder core. Owned by the task store; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    pub id: TaskId,
    pub user_id: UserId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_at: Option<Timestamp>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    TenMinutesBefore,
    ThirtyMinutesBefore,
    AtTime,
    Snooze,
}

/// What the user picked when setting a reminder. Resolved to an absolute
/// instant once, at creation time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReminderOffset {
    TenMinutesBefore,
    ThirtyMinutesBefore,
    At { at: Timestamp },
}

impl ReminderOffset {
    /// Returns `None` for a relative preset on a task without a due time, or
    /// when counting back leaves the representable range.
    pub fn resolve(&self, due_at: Option<Timestamp>) -> Option<Timestamp> {
        match self {
            ReminderOffset::TenMinutesBefore => due_at?.checked_sub(10 * MINUTE_MS),
            ReminderOffset::ThirtyMinutesBefore => due_at?.checked_sub(30 * MINUTE_MS),
            ReminderOffset::At { at } => Some(*at),
        }
    }

    pub fn kind(&self) -> ReminderKind {
        match self {
            ReminderOffset::TenMinutesBefore => ReminderKind::TenMinutesBefore,
            ReminderOffset::ThirtyMinutesBefore => ReminderKind::ThirtyMinutesBefore,
            ReminderOffset::At { .. } => ReminderKind::AtTime,
        }
    }
}

/// Reminder ids are only unique per user, so every lookup and every OS
/// registration goes through the pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub struct ReminderKey {
    pub user_id: UserId,
    pub reminder_id: ReminderId,
}

impl ReminderKey {
    pub fn new(user_id: UserId, reminder_id: ReminderId) -> Self {
        Self {
            user_id,
            reminder_id,
        }
    }
}

impl std::fmt::Display for ReminderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.reminder_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Reminder {
    pub id: ReminderId,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub fire_at: Timestamp,
    pub kind: ReminderKind,
    pub active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub delivered_at: Option<Timestamp>,
}

impl Reminder {
    pub fn key(&self) -> ReminderKey {
        ReminderKey::new(self.user_id, self.id)
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.delivered_at, Some(at) if at >= self.fire_at)
    }

    /// Active and not yet delivered: the rows that want an OS registration.
    pub fn is_pending(&self) -> bool {
        self.active && !self.is_delivered()
    }
}

/// Insert request. `id` is assigned by the store when unset.
#[derive(Debug, Clone)]
pub struct NewReminder {
    pub id: Option<ReminderId>,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub fire_at: Timestamp,
    pub kind: ReminderKind,
}

impl NewReminder {
    pub fn for_task(task: &Task, fire_at: Timestamp, kind: ReminderKind) -> Self {
        Self {
            id: None,
            task_id: task.id,
            user_id: task.user_id,
            fire_at,
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Settings {
    #[serde(default = "default_snooze_minutes")]
    pub snooze_minutes: u32,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_allow_inexact")]
    pub allow_inexact: bool,
}

impl Settings {
    pub fn snooze_ms(&self) -> i64 {
        i64::from(self.snooze_minutes.max(1)) * MINUTE_MS
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            snooze_minutes: default_snooze_minutes(),
            language: default_language(),
            allow_inexact: default_allow_inexact(),
        }
    }
}

fn default_snooze_minutes() -> u32 {
    10
}

fn default_language() -> String {
    "auto".to_string()
}

fn default_allow_inexact() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct RemindersFile {
    pub schema_version: u32,
    pub reminders: Vec<Reminder>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct TasksFile {
    pub schema_version: u32,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SettingsFile {
    pub schema_version: u32,
    pub settings: Settings,
}
