//! Log filter selection and the rolling file sink.
//!
//! Filter precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then
//! [`DEFAULT_LOG_FILTER`]. HTTP plumbing is quieted unless the operator picked
//! a filter on the command line.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const QUIET_DEPENDENCIES: &str = "hyper=warn,tower_http=warn";
pub const LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "wadqueue";

/// Target for lines relayed from the generator process; always kept in the
/// file sink even when the console is quieter.
pub const GENERATOR_LOG_TARGET: &str = "wadqueue_generator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    Cli,
    Server,
}

impl RuntimeLogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeLogMode::Cli => "cli",
            RuntimeLogMode::Server => "server",
        }
    }
}

/// What the process was started with that affects logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub rust_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogSettings {
    pub fn filters(&self) -> LogFilters {
        let chosen = self.chosen_filter();
        if self.cli_filter.is_some() || self.verbose > 0 {
            return LogFilters {
                console: chosen.clone(),
                file: chosen,
            };
        }

        let console = format!("{QUIET_DEPENDENCIES},{chosen}");
        let file = format!("{console},{GENERATOR_LOG_TARGET}=debug");
        LogFilters { console, file }
    }

    fn chosen_filter(&self) -> String {
        if let Some(filter) = &self.cli_filter {
            return filter.clone();
        }
        match self.verbose {
            0 => self
                .rust_log
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

/// Where the file layer writes, or why there is no file layer.
#[derive(Debug)]
pub enum LogSink {
    File(RollingFileAppender),
    ConsoleOnly {
        log_dir: Option<PathBuf>,
        reason: String,
    },
}

/// Open a daily rolling log under `<data_dir>/logs`.
pub fn open_log_sink(data_dir: Option<&Path>) -> LogSink {
    let Some(data_dir) = data_dir else {
        return LogSink::ConsoleOnly {
            log_dir: None,
            reason: "no data directory".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return LogSink::ConsoleOnly {
            log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(LOG_RETENTION_FILES)
        .build(&log_dir);

    match appender {
        Ok(appender) => LogSink::File(appender),
        Err(error) => LogSink::ConsoleOnly {
            log_dir: Some(log_dir),
            reason: format!("failed to open rolling log: {error}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn command_line_filter_wins_and_disables_quieting() {
        let settings = LogSettings {
            verbose: 2,
            cli_filter: Some("wadqueue_core=trace".to_string()),
            rust_log: Some("error".to_string()),
        };

        let filters = settings.filters();
        assert_eq!(filters.console, "wadqueue_core=trace");
        assert_eq!(filters.file, "wadqueue_core=trace");
    }

    #[test]
    fn verbosity_beats_rust_log() {
        let debug = LogSettings {
            verbose: 1,
            rust_log: Some("warn".to_string()),
            ..Default::default()
        };
        let trace = LogSettings {
            verbose: 3,
            ..Default::default()
        };

        assert_eq!(debug.filters().console, "debug");
        assert_eq!(trace.filters().file, "trace");
    }

    #[test]
    fn rust_log_keeps_dependencies_quiet() {
        let settings = LogSettings {
            rust_log: Some("wadqueue_core=debug".to_string()),
            ..Default::default()
        };

        assert_eq!(
            settings.filters().console,
            format!("{QUIET_DEPENDENCIES},wadqueue_core=debug")
        );
    }

    #[test]
    fn default_file_filter_keeps_generator_output() {
        let filters = LogSettings::default().filters();

        assert_eq!(filters.console, format!("{QUIET_DEPENDENCIES},info"));
        assert_eq!(
            filters.file,
            format!("{QUIET_DEPENDENCIES},info,{GENERATOR_LOG_TARGET}=debug")
        );
    }

    #[test]
    fn sink_creates_log_dir_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");

        let sink = open_log_sink(Some(data_dir.path()));

        assert!(matches!(sink, LogSink::File(_)));
        assert!(data_dir.path().join(LOG_DIR_NAME).is_dir());
    }

    #[test]
    fn sink_is_console_only_when_log_dir_is_unusable() {
        let not_a_dir = NamedTempFile::new().expect("named temp file");

        match open_log_sink(Some(not_a_dir.path())) {
            LogSink::File(_) => panic!("a file cannot hold a log directory"),
            LogSink::ConsoleOnly { log_dir, reason } => {
                assert_eq!(log_dir, Some(not_a_dir.path().join(LOG_DIR_NAME)));
                assert!(reason.contains("failed to create log directory"));
            }
        }
    }

    #[test]
    fn sink_is_console_only_without_data_dir() {
        assert!(matches!(
            open_log_sink(None),
            LogSink::ConsoleOnly { log_dir: None, .. }
        ));
    }
}
