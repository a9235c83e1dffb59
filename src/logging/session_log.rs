use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use log::{LevelFilter, Log, Record};

use osutils::files;

use super::LogEntry;

/// JSON-lines log of one mirroot invocation, kept for the operator and copied
/// into the installed system.
pub struct SessionLog {
    path: PathBuf,
    target: Option<Mutex<File>>,
    max_level: LevelFilter,
}

/// `<dir>/mirroot-<command>-<timestamp>.log`
pub fn session_log_path(dir: impl AsRef<Path>, command: &str, at: DateTime<Utc>) -> PathBuf {
    dir.as_ref().join(format!(
        "mirroot-{command}-{}.log",
        at.format("%Y%m%dT%H%M%SZ")
    ))
}

impl SessionLog {
    pub fn new(target: impl AsRef<Path>) -> Self {
        let file = match files::create_file_mode(target.as_ref(), 0o600) {
            Ok(f) => Some(Mutex::new(f)),
            Err(err) => {
                eprintln!("Logging setup error: failed to create session log file: {err:?}");
                None
            }
        };

        Self {
            path: target.as_ref().to_path_buf(),
            max_level: LevelFilter::Trace,
            target: file,
        }
    }

    pub fn with_max_level(self, max_level: LevelFilter) -> Self {
        Self { max_level, ..self }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.target.is_some()
    }

    pub fn into_logger(self) -> Box<dyn Log> {
        Box::new(self)
    }

    /// Best effort attempt to write the log entry to the file
    fn write_entry(&self, record: &Record) -> Result<(), Box<dyn std::error::Error + '_>> {
        if let Some(file) = self.target.as_ref() {
            let mut serialized = serde_json::to_string(&LogEntry::from(record))?;
            serialized.push('\n');

            let mut file_lock = file.lock()?;
            file_lock.write_all(serialized.as_bytes())?;
        }

        Ok(())
    }
}

impl Log for SessionLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.target.is_some() && metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        let _ = self.write_entry(record);
    }

    fn flush(&self) {
        // A crashed session must leave its log on disk.
        if let Some(Ok(mut file)) = self.target.as_ref().map(|f| f.lock()) {
            let _ = file.flush();
            let _ = file.sync_data();
        }
    }
}
