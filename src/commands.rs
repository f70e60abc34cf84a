use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ReminderId, ReminderKey, ReminderOffset, Task, TaskId, UserId};
use crate::service::ReminderService;
use crate::storage::{Storage, StorageError};
use crate::tasks::TaskBook;

/// One line of input on the daemon's command channel.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Create {
        user_id: UserId,
        task_id: TaskId,
        offset: ReminderOffset,
    },
    Cancel {
        user_id: UserId,
        reminder_id: ReminderId,
    },
    Snooze {
        user_id: UserId,
        reminder_id: ReminderId,
    },
    Stop {
        user_id: UserId,
        reminder_id: ReminderId,
    },
    List {
        task_id: TaskId,
    },
    PutTask {
        task: Task,
    },
    DeleteTask {
        user_id: UserId,
        task_id: TaskId,
    },
    Compact,
    Stats,
    Registrations,
}

#[derive(Debug, Serialize)]
pub struct CommandResult<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

pub trait CommandCtx {
    fn service(&self) -> &ReminderService;
    fn task_book(&self) -> &TaskBook;
    fn storage(&self) -> &Storage;
}

fn ok<T>(data: T) -> CommandResult<T> {
    CommandResult {
        ok: true,
        data: Some(data),
        error: None,
    }
}

fn err<T>(message: &str) -> CommandResult<T> {
    CommandResult {
        ok: false,
        data: None,
        error: Some(message.to_string()),
    }
}

fn encode<T: Serialize>(data: T) -> CommandResult<Value> {
    match serde_json::to_value(data) {
        Ok(value) => ok(value),
        Err(error) => err(&format!("encode error: {error}")),
    }
}

fn respond<T: Serialize, E: std::fmt::Display>(result: Result<T, E>) -> CommandResult<Value> {
    match result {
        Ok(data) => encode(data),
        Err(error) => err(&error.to_string()),
    }
}

fn persist_tasks(ctx: &impl CommandCtx) -> Result<(), StorageError> {
    ctx.storage().save_tasks(&ctx.task_book().tasks_file())
}

fn put_task_impl(ctx: &impl CommandCtx, task: Task) -> CommandResult<Value> {
    let (task_id, user_id, closed) = (task.id, task.user_id, task.status.is_closed());
    ctx.task_book().upsert(task.clone());
    if let Err(error) = persist_tasks(ctx) {
        return err(&format!("storage error: {error}"));
    }
    if closed {
        if let Err(error) = ctx.service().on_task_closed(task_id, user_id) {
            return err(&error.to_string());
        }
    }
    encode(task)
}

fn delete_task_impl(
    ctx: &impl CommandCtx,
    user_id: UserId,
    task_id: TaskId,
) -> CommandResult<Value> {
    // Reminders go first: a failure here leaves both the task and its rows intact.
    let removed = match ctx.service().on_task_deleted(task_id, user_id) {
        Ok(removed) => removed,
        Err(error) => return err(&error.to_string()),
    };
    if ctx.task_book().remove(user_id, task_id).is_none() {
        return err("task not found");
    }
    if let Err(error) = persist_tasks(ctx) {
        return err(&format!("storage error: {error}"));
    }
    encode(removed)
}

pub fn dispatch(ctx: &impl CommandCtx, command: Command) -> CommandResult<Value> {
    let service = ctx.service();
    match command {
        Command::Create {
            user_id,
            task_id,
            offset,
        } => respond(service.create_or_replace_reminder(user_id, task_id, offset)),
        Command::Cancel {
            user_id,
            reminder_id,
        } => respond(service.cancel_reminder(ReminderKey::new(user_id, reminder_id))),
        Command::Snooze {
            user_id,
            reminder_id,
        } => respond(service.snooze(ReminderKey::new(user_id, reminder_id))),
        Command::Stop {
            user_id,
            reminder_id,
        } => respond(service.stop(ReminderKey::new(user_id, reminder_id))),
        Command::List { task_id } => encode(service.list_reminders_for_task(task_id)),
        Command::PutTask { task } => put_task_impl(ctx, task),
        Command::DeleteTask { user_id, task_id } => delete_task_impl(ctx, user_id, task_id),
        Command::Compact => respond(service.compact()),
        Command::Stats => encode(service.stats()),
        Command::Registrations => encode(service.registrations()),
    }
}

/// Parses and runs one JSON line. Blank lines are rejected like any other
/// malformed input.
pub fn dispatch_line(ctx: &impl CommandCtx, line: &str) -> CommandResult<Value> {
    match serde_json::from_str::<Command>(line.trim()) {
        Ok(command) => {
            log::debug!("commands: {command:?}");
            dispatch(ctx, command)
        }
        Err(error) => {
            log::warn!("commands: rejected line: {error}");
            err(&format!("invalid command: {error}"))
        }
    }
}

#[cfg(all(feature = "app", not(test)))]
pub struct DaemonCtx {
    pub service: std::sync::Arc<ReminderService>,
    pub tasks: TaskBook,
    pub storage: Storage,
}

#[cfg(all(feature = "app", not(test)))]
impl CommandCtx for DaemonCtx {
    fn service(&self) -> &ReminderService {
        &self.service
    }

    fn task_book(&self) -> &TaskBook {
        &self.tasks
    }

    fn storage(&self) -> &Storage {
        &self.storage
    }
}
