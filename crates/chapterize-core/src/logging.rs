//! Structured logging: one `key=value` line per event, written to stderr
//! and appended to `<log_dir>/convert.log`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    /// Parse the `log_level` config string; unrecognized values fall back to
    /// `Info`.
    pub fn from_config_str(s: &str) -> Level {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Level::Debug,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }
}

/// Escape a message for inclusion inside a quoted `message="..."` field:
/// backslashes and double quotes are escaped, newlines collapsed to spaces
/// so a single event never spans multiple log lines.
fn escape_message(message: &str) -> String {
    message.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', " ")
}

/// Run-scoped logging context: current stage and book hash, threaded
/// through stage functions rather than read from process globals
/// (redesign flag on dynamic env-var globals).
pub struct Reporter {
    min_level: Level,
    log_file: Option<Mutex<std::fs::File>>,
}

impl Reporter {
    /// Open (creating if needed) `<log_dir>/convert.log` for append. A
    /// failure to open the log file is non-fatal: the reporter still writes
    /// to stderr, and the open error is itself logged there.
    pub fn new(log_dir: &Path, min_level: Level) -> Self {
        let path = log_file_path(log_dir);
        let log_file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(Mutex::new(file)),
            Err(e) => {
                eprintln!(
                    "timestamp={} level=WARN stage=logging book_hash=0000000000000000 message=\"failed to open log file {}: {e}\"",
                    Utc::now().to_rfc3339(),
                    path.display()
                );
                None
            }
        };
        Reporter { min_level, log_file }
    }

    pub fn log(&self, level: Level, stage: &str, book_hash: &str, message: &str) {
        if level < self.min_level {
            return;
        }
        let line = format!(
            "timestamp={} level={} stage={} book_hash={} message=\"{}\"",
            Utc::now().to_rfc3339(),
            level.as_str(),
            stage,
            book_hash,
            escape_message(message)
        );
        eprintln!("{line}");
        if let Some(log_file) = &self.log_file {
            if let Ok(mut file) = log_file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    pub fn debug(&self, stage: &str, book_hash: &str, message: &str) {
        self.log(Level::Debug, stage, book_hash, message);
    }
    pub fn info(&self, stage: &str, book_hash: &str, message: &str) {
        self.log(Level::Info, stage, book_hash, message);
    }
    pub fn warn(&self, stage: &str, book_hash: &str, message: &str) {
        self.log(Level::Warn, stage, book_hash, message);
    }
    pub fn error(&self, stage: &str, book_hash: &str, message: &str) {
        self.log(Level::Error, stage, book_hash, message);
    }
}

fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join("convert.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn info_below_debug_threshold_is_written() {
        let td = tempdir().unwrap();
        let reporter = Reporter::new(td.path(), Level::Debug);
        reporter.info("validate", "abc0123456789def", "starting validate");
        let content = std::fs::read_to_string(log_file_path(td.path())).unwrap();
        assert!(content.contains("level=INFO"));
        assert!(content.contains("stage=validate"));
        assert!(content.contains("message=\"starting validate\""));
    }

    #[test]
    fn debug_suppressed_under_info_threshold() {
        let td = tempdir().unwrap();
        let reporter = Reporter::new(td.path(), Level::Info);
        reporter.debug("validate", "abc0123456789def", "chatty detail");
        let content = std::fs::read_to_string(log_file_path(td.path())).unwrap_or_default();
        assert!(!content.contains("chatty detail"));
    }

    #[test]
    fn message_quotes_and_newlines_are_escaped() {
        let td = tempdir().unwrap();
        let reporter = Reporter::new(td.path(), Level::Debug);
        reporter.error("archive", "abc0123456789def", "bad \"quote\"\nsecond line");
        let content = std::fs::read_to_string(log_file_path(td.path())).unwrap();
        assert!(content.contains("message=\"bad \\\"quote\\\" second line\""));
    }

    #[test]
    fn from_config_str_falls_back_to_info() {
        assert_eq!(Level::from_config_str("debug"), Level::Debug);
        assert_eq!(Level::from_config_str("bogus"), Level::Info);
    }
}
