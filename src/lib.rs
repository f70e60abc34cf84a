pub mod alert;
pub mod clock;
pub mod commands;
pub mod compactor;
pub mod delivery;
pub mod events;
pub mod logging;
pub mod models;
pub mod platform;
pub mod recovery;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod store;
pub mod tasks;

use std::ffi::OsString;
use std::path::PathBuf;

pub use crate::service::{ReminderError, ReminderService, ScheduledReminder};

pub const DATA_DIR_ENV: &str = "TASK_ALARM_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "task-alarm-data";

/// The environment variable wins over the first CLI argument.
pub fn resolve_data_dir(env: Option<OsString>, arg: Option<OsString>) -> PathBuf {
    env.filter(|value| !value.is_empty())
        .or(arg.filter(|value| !value.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

#[cfg(all(feature = "app", not(test)))]
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    use std::io::Write;
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, BufReader};

    use crate::alert::{AlertLabels, AlertLanguage, ConsoleAlertSurface};
    use crate::clock::{Clock, SystemClock};
    use crate::commands::{dispatch_line, DaemonCtx};
    use crate::delivery::run_delivery_worker;
    use crate::events::wake_channel;
    use crate::platform::TokioAlarmPlatform;
    use crate::storage::Storage;
    use crate::store::ReminderStore;
    use crate::tasks::TaskBook;

    let data_dir = resolve_data_dir(
        std::env::var_os(DATA_DIR_ENV),
        std::env::args_os().nth(1),
    );
    let storage = Storage::new(data_dir.clone());
    storage.ensure_dirs()?;
    logging::init_logging(&data_dir)?;
    log::info!("task-alarm starting data_dir={}", data_dir.display());

    let settings = storage.load_or_init_settings()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (wake_tx, wake_rx) = wake_channel();
    let tasks = TaskBook::new(storage.load_tasks()?.tasks);
    let store = ReminderStore::open(storage.clone())?;
    let platform = Arc::new(TokioAlarmPlatform::new(
        runtime.handle().clone(),
        Arc::clone(&clock),
        wake_tx.clone(),
    ));
    let language = AlertLanguage::resolve(&settings.language);
    log::info!(
        "settings snooze_minutes={} language={language:?} allow_inexact={}",
        settings.snooze_minutes,
        settings.allow_inexact
    );
    let service = Arc::new(ReminderService::new(
        store,
        Arc::new(tasks.clone()),
        platform,
        Arc::new(ConsoleAlertSurface::stdout()),
        clock,
        settings,
        AlertLabels::for_language(language),
        wake_tx,
    ));

    runtime.spawn(run_delivery_worker(service.delivery_handler(), wake_rx));
    let report = service.recover();
    for failure in &report.failures {
        log::warn!(
            "startup: reminder={} not restored: {}",
            failure.reminder,
            failure.reason
        );
    }
    if !service.exact_permission_granted() {
        log::warn!("startup: exact wakes unavailable, reminders may fire late");
    }

    let ctx = DaemonCtx {
        service,
        tasks,
        storage,
    };
    runtime.block_on(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = std::io::stdout();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let result = tokio::task::block_in_place(|| dispatch_line(&ctx, &line));
            let mut out = serde_json::to_vec(&result)?;
            out.push(b'\n');
            // Alert events share stdout; one write per line keeps them apart.
            stdout.write_all(&out)?;
            stdout.flush()?;
        }
        log::info!("stdin closed, shutting down");
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
