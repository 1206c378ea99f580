//! Run log lines and progress snapshots, pushed onto two unbounded channels
//! so the run never waits on whoever is watching it.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:<5} {}",
            self.timestamp.format("%H:%M:%S"),
            self.level.as_str(),
            self.message
        )
    }
}

/// `None` fields leave the consumer's current value unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub percent: Option<u8>,
    pub status: Option<String>,
}

pub struct RunReporter {
    log_tx: Sender<LogLine>,
    progress_tx: Sender<ProgressSnapshot>,
    log_file: Mutex<Option<BufWriter<File>>>,
    last_percent: Mutex<Option<u8>>,
}

impl RunReporter {
    pub fn channel() -> (Self, Receiver<LogLine>, Receiver<ProgressSnapshot>) {
        let (log_tx, log_rx) = mpsc::channel();
        let (progress_tx, progress_rx) = mpsc::channel();
        let reporter = Self {
            log_tx,
            progress_tx,
            log_file: Mutex::new(None),
            last_percent: Mutex::new(None),
        };
        (reporter, log_rx, progress_rx)
    }

    /// Mirrors every following log line into `path` (appending).
    pub fn attach_log_file(&self, path: &Path) -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        *self.log_file.lock().unwrap_or_else(|e| e.into_inner()) = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn detach_log_file(&self) {
        let mut guard = self.log_file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut writer) = guard.take() {
            let _ = writer.flush();
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(target: "run", "{message}"),
            LogLevel::Info => info!(target: "run", "{message}"),
            LogLevel::Warn => warn!(target: "run", "{message}"),
            LogLevel::Error => error!(target: "run", "{message}"),
        }

        let line = LogLine {
            timestamp: Local::now(),
            level,
            message,
        };
        {
            let mut guard = self.log_file.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(writer) = guard.as_mut() {
                let _ = writeln!(writer, "{line}");
            }
        }
        let _ = self.log_tx.send(line);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Sends a snapshot. Percent values never go backwards within a run.
    pub fn progress(&self, percent: Option<u8>, status: Option<String>) {
        let percent = percent.map(|p| {
            let mut last = self.last_percent.lock().unwrap_or_else(|e| e.into_inner());
            let p = p.min(100).max(last.unwrap_or(0));
            *last = Some(p);
            p
        });
        let _ = self.progress_tx.send(ProgressSnapshot { percent, status });
    }

    pub fn status(&self, status: impl Into<String>) {
        self.progress(None, Some(status.into()));
    }
}

impl Drop for RunReporter {
    fn drop(&mut self) {
        self.detach_log_file();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_and_progress_reach_their_channels() {
        let (reporter, logs, progress) = RunReporter::channel();
        reporter.info("hello");
        reporter.warn("careful");
        reporter.progress(Some(40), Some("Downloading".into()));
        reporter.progress(Some(30), None);
        drop(reporter);

        let lines: Vec<LogLine> = logs.iter().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].level, LogLevel::Warn);
        assert_eq!(lines[1].message, "careful");

        let snaps: Vec<ProgressSnapshot> = progress.iter().collect();
        assert_eq!(snaps[0].percent, Some(40));
        assert_eq!(snaps[0].status.as_deref(), Some("Downloading"));
        assert_eq!(snaps[1].percent, Some(40));
    }

    #[test]
    fn sending_without_a_consumer_does_not_fail() {
        let (reporter, logs, progress) = RunReporter::channel();
        drop(logs);
        drop(progress);
        reporter.error("nobody listens");
        reporter.status("still fine");
    }

    #[test]
    fn log_file_mirrors_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("workbench.log");
        let (reporter, _logs, _progress) = RunReporter::channel();
        reporter.info("before attach");
        reporter.attach_log_file(&path).expect("attach");
        reporter.info("first");
        reporter.error("second");
        reporter.detach_log_file();

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("INFO  first"), "{}", lines[0]);
        assert!(lines[1].ends_with("ERROR second"), "{}", lines[1]);
    }
}
