use std::path::{Path, PathBuf};

pub const LOG_DIR: &str = "logs";
pub const LOG_FILE_BASENAME: &str = "task-alarm";
pub const LOG_FILE_SUFFIX: &str = "log";
pub const LOG_ROTATE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
pub const LOG_ROTATE_KEEP_FILES: usize = 10;

/// Log files live next to reminders.json, under `logs/`.
pub fn log_directory(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR)
}

/// `TASK_ALARM_LOG` wins over `RUST_LOG`; blank values count as unset.
pub fn log_spec(app_var: Option<String>, rust_log: Option<String>) -> String {
    let default_spec = if cfg!(debug_assertions) {
        "warn,task_alarm_lib=debug"
    } else {
        "warn,task_alarm_lib=info"
    };
    app_var
        .filter(|value| !value.trim().is_empty())
        .or_else(|| rust_log.filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| default_spec.to_string())
}

#[cfg(all(feature = "app", not(test)))]
pub fn init_logging(data_dir: &Path) -> Result<(), flexi_logger::FlexiLoggerError> {
    use flexi_logger::{
        detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, Naming, WriteMode,
    };

    let dir = log_directory(data_dir);
    std::fs::create_dir_all(&dir)?;

    let spec = log_spec(
        std::env::var("TASK_ALARM_LOG").ok(),
        std::env::var("RUST_LOG").ok(),
    );

    // stdout carries command results, so terminal logs go to stderr.
    Logger::try_with_str(spec)?
        .log_to_file(
            FileSpec::default()
                .directory(dir.clone())
                .basename(LOG_FILE_BASENAME)
                .suffix(LOG_FILE_SUFFIX),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .format_for_files(detailed_format)
        .rotate(
            Criterion::Size(LOG_ROTATE_SIZE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(LOG_ROTATE_KEEP_FILES),
        )
        .duplicate_to_stderr(if cfg!(debug_assertions) {
            Duplicate::Info
        } else {
            Duplicate::None
        })
        .start()?;

    install_panic_hook();

    log::info!(
        "logger initialized dir={} rotate_size_bytes={} keep_files={}",
        dir.display(),
        LOG_ROTATE_SIZE_BYTES,
        LOG_ROTATE_KEEP_FILES
    );
    Ok(())
}

#[cfg(all(feature = "app", not(test)))]
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info: &std::panic::PanicHookInfo<'_>| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("<non-string panic payload>");
        let location = info
            .location()
            .map(|loc| format!("{loc}"))
            .unwrap_or_else(|| "<unknown>".to_string());
        let backtrace = std::backtrace::Backtrace::force_capture();

        log::error!("panic: payload={payload} location={location}\nbacktrace:\n{backtrace}");
        default_hook(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_variable_takes_precedence() {
        let spec = log_spec(Some("debug".to_string()), Some("trace".to_string()));
        assert_eq!(spec, "debug");
    }

    #[test]
    fn blank_values_fall_through_to_default() {
        assert_eq!(
            log_spec(Some("  ".to_string()), Some("info".to_string())),
            "info"
        );
        let spec = log_spec(None, Some(String::new()));
        assert!(spec.starts_with("warn,task_alarm_lib="));
    }

    #[test]
    fn logs_live_under_the_data_dir() {
        let dir = log_directory(Path::new("/tmp/alarm"));
        assert_eq!(dir, Path::new("/tmp/alarm/logs"));
    }
}
