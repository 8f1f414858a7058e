use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LEVEL: &str = "info";
const DEFAULT_LOG_FILE: &str = "./logs/extent-duper.log";

/// Where and how verbosely a dedupe run logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub file_path: PathBuf,
}

impl LogSettings {
    /// `TRACING_LEVEL` takes a full filter directive, e.g. `extent_duper_core=debug`.
    pub fn from_env() -> Self {
        Self::from_vars(env::var("TRACING_LEVEL").ok(), env::var("LOG_FILE_PATH").ok())
    }

    fn from_vars(level: Option<String>, file_path: Option<String>) -> Self {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        Self {
            level: non_empty(level).unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
            file_path: PathBuf::from(non_empty(file_path).unwrap_or_else(|| DEFAULT_LOG_FILE.to_string())),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
    }

    /// Directory and file name for the appender; a bare name logs into the working directory.
    fn split_file_path(&self) -> (PathBuf, PathBuf) {
        let dir = match self.file_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = self
            .file_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("extent-duper.log"));
        (dir, name)
    }
}

/// Console plus file logging. The returned guard flushes the file writer on drop.
pub fn init_logger(settings: &LogSettings) -> WorkerGuard {
    let (dir, name) = settings.split_file_path();
    let dir_error = create_log_dir(&dir).err();

    let (non_blocking, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, &name));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .with_target(false)
                .without_time()
                .with_ansi(io::stdout().is_terminal()),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_thread_names(true)
                .with_ansi(false),
        )
        .with(settings.filter())
        .init();

    if let Some(e) = dir_error {
        warn!("Could not create log directory {}: {}", dir.display(), e);
    }
    info!("Logging at '{}' to stdout and {}", settings.level, settings.file_path.display());

    guard
}

fn create_log_dir(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_or_blank_vars_use_defaults() {
        let settings = LogSettings::from_vars(None, Some("  ".to_string()));
        assert_eq!(settings.level, "info");
        assert_eq!(settings.file_path, PathBuf::from("./logs/extent-duper.log"));
        assert_eq!(
            settings.split_file_path(),
            (PathBuf::from("./logs"), PathBuf::from("extent-duper.log"))
        );
    }

    #[test]
    fn test_bare_file_name_logs_to_working_directory() {
        let settings = LogSettings::from_vars(Some("debug".to_string()), Some("run.log".to_string()));
        assert_eq!(settings.level, "debug");
        assert_eq!(settings.split_file_path(), (PathBuf::from("."), PathBuf::from("run.log")));
    }

    #[test]
    fn test_log_directory_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("logs");
        create_log_dir(&dir).unwrap();
        assert!(dir.is_dir());
    }
}
