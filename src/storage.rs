use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{RemindersFile, Settings, SettingsFile, TasksFile};

pub const SCHEMA_VERSION: u32 = 1;

const REMINDERS_FILE: &str = "reminders.json";
const TASKS_FILE: &str = "tasks.json";
const SETTINGS_FILE: &str = "settings.json";
const BACKUP_DIR: &str = "backups";
const BACKUP_LIMIT: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io(err) if err.kind() == ErrorKind::NotFound)
    }
}

/// JSON files under one data directory. Every write goes through a temp file
/// and a rename, so a reader never observes a half-written file.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        fs::create_dir_all(self.root.join(BACKUP_DIR))?;
        Ok(())
    }

    /// Missing file means an empty store.
    pub fn load_reminders(&self) -> Result<RemindersFile, StorageError> {
        match self.load_json(self.root.join(REMINDERS_FILE)) {
            Err(error) if error.is_not_found() => Ok(RemindersFile {
                schema_version: SCHEMA_VERSION,
                reminders: Vec::new(),
            }),
            other => other,
        }
    }

    pub fn save_reminders(
        &self,
        data: &RemindersFile,
        with_backup: bool,
    ) -> Result<(), StorageError> {
        if with_backup {
            return self.write_with_backup(REMINDERS_FILE, data);
        }
        self.write_atomic(self.root.join(REMINDERS_FILE), data)
    }

    pub fn load_tasks(&self) -> Result<TasksFile, StorageError> {
        match self.load_json(self.root.join(TASKS_FILE)) {
            Err(error) if error.is_not_found() => Ok(TasksFile {
                schema_version: SCHEMA_VERSION,
                tasks: Vec::new(),
            }),
            other => other,
        }
    }

    pub fn save_tasks(&self, data: &TasksFile) -> Result<(), StorageError> {
        self.write_atomic(self.root.join(TASKS_FILE), data)
    }

    pub fn load_settings(&self) -> Result<SettingsFile, StorageError> {
        self.load_json(self.root.join(SETTINGS_FILE))
    }

    pub fn save_settings(&self, data: &SettingsFile) -> Result<(), StorageError> {
        self.write_atomic(self.root.join(SETTINGS_FILE), data)
    }

    /// Writes the defaults on first run so they can be edited by hand.
    pub fn load_or_init_settings(&self) -> Result<Settings, StorageError> {
        match self.load_settings() {
            Ok(file) => Ok(file.settings),
            Err(error) if error.is_not_found() => {
                let file = SettingsFile {
                    schema_version: SCHEMA_VERSION,
                    settings: Settings::default(),
                };
                self.save_settings(&file)?;
                Ok(file.settings)
            }
            Err(error) => Err(error),
        }
    }

    fn load_json<T: DeserializeOwned>(&self, path: PathBuf) -> Result<T, StorageError> {
        let mut file = File::open(path)?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        Ok(serde_json::from_str(&buf)?)
    }

    fn write_with_backup<T: Serialize>(
        &self,
        filename: &str,
        data: &T,
    ) -> Result<(), StorageError> {
        let path = self.root.join(filename);
        if path.exists() {
            self.create_backup(&path)?;
        }
        self.write_atomic(path, data)
    }

    fn write_atomic<T: Serialize>(&self, path: PathBuf, data: &T) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(data)?;
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(temp_path, path)?;
        Ok(())
    }

    fn create_backup(&self, path: &Path) -> Result<(), StorageError> {
        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%3f").to_string();
        let backup_name = format!("reminders-{timestamp}.json");
        fs::copy(path, self.root.join(BACKUP_DIR).join(backup_name))?;
        self.trim_backups()?;
        Ok(())
    }

    pub fn list_backups(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = fs::read_dir(self.root.join(BACKUP_DIR))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        // Names embed a sortable timestamp.
        names.sort();
        Ok(names)
    }

    fn trim_backups(&self) -> Result<(), StorageError> {
        let names = self.list_backups()?;
        let to_remove = names.len().saturating_sub(BACKUP_LIMIT);
        for name in names.into_iter().take(to_remove) {
            let _ = fs::remove_file(self.root.join(BACKUP_DIR).join(name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Reminder, ReminderKind, Settings};

    fn make_reminder(id: i64) -> Reminder {
        Reminder {
            id,
            task_id: 42,
            user_id: 1,
            fire_at: 1000,
            kind: ReminderKind::AtTime,
            active: true,
            created_at: 1,
            updated_at: 1,
            delivered_at: None,
        }
    }

    #[test]
    fn missing_reminders_and_tasks_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        storage.ensure_dirs().unwrap();

        let reminders = storage.load_reminders().unwrap();
        assert_eq!(reminders.schema_version, SCHEMA_VERSION);
        assert!(reminders.reminders.is_empty());
        assert!(storage.load_tasks().unwrap().tasks.is_empty());
        assert!(storage.load_settings().unwrap_err().is_not_found());
    }

    #[test]
    fn save_and_load_reminders_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        storage.ensure_dirs().unwrap();

        let data = RemindersFile {
            schema_version: SCHEMA_VERSION,
            reminders: vec![make_reminder(1), make_reminder(2)],
        };
        storage.save_reminders(&data, false).unwrap();

        let loaded = storage.load_reminders().unwrap();
        assert_eq!(loaded.reminders, data.reminders);
        assert!(!dir.path().join("reminders.tmp").exists());
    }

    #[test]
    fn corrupt_reminders_file_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        fs::write(dir.path().join(REMINDERS_FILE), b"{not json").unwrap();
        assert!(matches!(
            storage.load_reminders(),
            Err(StorageError::Json(_))
        ));
    }

    #[test]
    fn backups_are_created_and_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        storage.ensure_dirs().unwrap();

        let data = RemindersFile {
            schema_version: SCHEMA_VERSION,
            reminders: vec![make_reminder(1)],
        };
        // First save has nothing to back up.
        storage.save_reminders(&data, true).unwrap();
        assert!(storage.list_backups().unwrap().is_empty());

        for _ in 0..(BACKUP_LIMIT + 3) {
            storage.save_reminders(&data, true).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let backups = storage.list_backups().unwrap();
        assert_eq!(backups.len(), BACKUP_LIMIT);
        assert!(backups.iter().all(|name| name.starts_with("reminders-")));
    }

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let file = SettingsFile {
            schema_version: SCHEMA_VERSION,
            settings: Settings {
                snooze_minutes: 5,
                ..Settings::default()
            },
        };
        storage.save_settings(&file).unwrap();
        assert_eq!(storage.load_settings().unwrap().settings.snooze_minutes, 5);
    }

    #[test]
    fn first_run_writes_default_settings() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let settings = storage.load_or_init_settings().unwrap();
        assert_eq!(settings, Settings::default());
        assert!(dir.path().join(SETTINGS_FILE).exists());

        fs::write(
            dir.path().join(SETTINGS_FILE),
            br#"{"schema_version":1,"settings":{"snooze_minutes":3}}"#,
        )
        .unwrap();
        let settings = storage.load_or_init_settings().unwrap();
        assert_eq!(settings.snooze_minutes, 3);
        assert_eq!(settings.language, "auto");
    }
}
