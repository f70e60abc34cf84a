use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sys_locale::get_locale;

use crate::models::{Reminder, ReminderKey, Task, TaskId, Timestamp, UserId};

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert surface unavailable: {0}")]
    Unavailable(String),
    #[error("foreground launch blocked: {0}")]
    ForegroundBlocked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLanguage {
    Zh,
    En,
}

impl AlertLanguage {
    /// `"zh"` / `"en"` pin the language, anything else follows the system locale.
    pub fn resolve(setting: &str) -> Self {
        match setting.trim().to_lowercase().as_str() {
            "zh" => AlertLanguage::Zh,
            "en" => AlertLanguage::En,
            _ => Self::detect(),
        }
    }

    fn detect() -> Self {
        let locale = get_locale().unwrap_or_default().to_lowercase();
        if locale.starts_with("zh") {
            AlertLanguage::Zh
        } else {
            AlertLanguage::En
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertLabels {
    pub title_prefix: &'static str,
    pub empty_description: &'static str,
    pub snooze: &'static str,
    pub stop: &'static str,
}

impl AlertLabels {
    pub fn for_language(lang: AlertLanguage) -> Self {
        match lang {
            AlertLanguage::Zh => AlertLabels {
                title_prefix: "提醒",
                empty_description: "任务提醒",
                snooze: "稍后提醒",
                stop: "停止",
            },
            AlertLanguage::En => AlertLabels {
                title_prefix: "ALARM",
                empty_description: "Task reminder alarm",
                snooze: "Snooze",
                stop: "Stop",
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    Snooze,
    Stop,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AlertControl {
    pub action: AlertAction,
    pub label: String,
}

/// What the user sees when a reminder fires.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Alert {
    pub reminder: ReminderKey,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub title: String,
    pub description: String,
    pub fire_at: Timestamp,
    pub controls: Vec<AlertControl>,
}

impl Alert {
    pub fn build(
        task: &Task,
        reminder: &Reminder,
        labels: &AlertLabels,
        snooze_minutes: u32,
    ) -> Self {
        let description = task
            .description
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or(labels.empty_description)
            .to_string();
        Self {
            reminder: reminder.key(),
            task_id: task.id,
            user_id: task.user_id,
            title: format!("{}: {}", labels.title_prefix, task.title),
            description,
            fire_at: reminder.fire_at,
            controls: vec![
                AlertControl {
                    action: AlertAction::Snooze,
                    label: format!("{} {snooze_minutes}m", labels.snooze),
                },
                AlertControl {
                    action: AlertAction::Stop,
                    label: labels.stop.to_string(),
                },
            ],
        }
    }
}

/// Where alerts go. The persistent channel is the one that counts; bringing the
/// app to the foreground is best effort.
pub trait AlertSurface: Send + Sync {
    fn post_persistent(&self, alert: &Alert) -> Result<(), AlertError>;
    fn bring_to_foreground(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Renders an instant for people. Never parsed back.
pub fn format_fire_time<Tz: TimeZone>(at: Timestamp, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    match DateTime::<Utc>::from_timestamp_millis(at) {
        Some(instant) => instant
            .with_timezone(tz)
            .format("%b %d, %Y at %-I:%M %p")
            .to_string(),
        None => at.to_string(),
    }
}

/// One line on the daemon's output stream, next to command results.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum SurfaceEvent<'a> {
    Alert { alert: &'a Alert, fire_time: String },
    Foreground { reminder: ReminderKey },
}

/// Alerts as JSON event lines on a writer (stdout for the daemon). Each event
/// goes out in a single `write_all`, so it never splits a command reply.
pub struct WriterAlertSurface<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> WriterAlertSurface<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: &SurfaceEvent<'_>) -> Result<(), String> {
        let mut line = serde_json::to_vec(event).map_err(|err| err.to_string())?;
        line.push(b'\n');
        let mut out = self.out.lock().map_err(|_| "writer poisoned".to_string())?;
        out.write_all(&line)
            .and_then(|_| out.flush())
            .map_err(|err| err.to_string())
    }
}

pub type ConsoleAlertSurface = WriterAlertSurface<std::io::Stdout>;

impl ConsoleAlertSurface {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> AlertSurface for WriterAlertSurface<W> {
    fn post_persistent(&self, alert: &Alert) -> Result<(), AlertError> {
        self.emit(&SurfaceEvent::Alert {
            alert,
            fire_time: format_fire_time(alert.fire_at, &chrono::Local),
        })
        .map_err(AlertError::Unavailable)
    }

    fn bring_to_foreground(&self, alert: &Alert) -> Result<(), AlertError> {
        self.emit(&SurfaceEvent::Foreground {
            reminder: alert.reminder,
        })
        .map_err(AlertError::ForegroundBlocked)
    }
}
