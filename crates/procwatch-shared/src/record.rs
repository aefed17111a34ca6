use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Severity of a forwarded record, mirrors [`log::Level`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `pad` so that width/alignment specifiers apply
        f.pad(self.as_str())
    }
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => LogLevel::Error,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Info => LogLevel::Info,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Trace => LogLevel::Trace,
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// One log event as produced by a client process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Name of the handler (logger) that produced the record
    pub logger: String,
    pub level: LogLevel,
    pub message: String,
    /// Milliseconds since the UNIX epoch, taken by the producer
    pub timestamp_ms: u64,
    /// PID of the producing process
    pub pid: u32,
    pub target: String,
    pub module_path: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl LogRecord {
    pub fn new(logger: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        let logger = logger.into();
        Self {
            target: logger.clone(),
            logger,
            level,
            message: message.into(),
            timestamp_ms: now_millis(),
            pid: std::process::id(),
            module_path: None,
            file: None,
            line: None,
        }
    }

    /// Capture a [`log::Record`] emitted through the `log` facade.
    pub fn from_log(logger: &str, record: &log::Record) -> Self {
        Self {
            logger: logger.to_string(),
            level: record.level().into(),
            message: record.args().to_string(),
            timestamp_ms: now_millis(),
            pid: std::process::id(),
            target: record.target().to_string(),
            module_path: record.module_path().map(str::to_string),
            file: record.file().map(str::to_string),
            line: record.line(),
        }
    }
}

/// Identity of a client asking the collector to stop.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub requester: String,
    pub pid: u32,
}

/// Everything that can travel in a frame.
///
/// The variant tag is what tells a shutdown request apart from a record, a record can never be
/// mistaken for the sentinel whatever its content.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Record(LogRecord),
    Shutdown(ShutdownRequest),
}

impl LogPayload {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, LogPayload::Shutdown(_))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
