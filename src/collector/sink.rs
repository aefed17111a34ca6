use chrono::{DateTime, Local};
use procwatch_shared::LogRecord;
use std::fs::{self, File};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Destination of the records received by the collector.
///
/// Shared by every connection task, implementations serialize appends themselves.
pub trait RecordSink: Send + Sync {
    fn append(&self, record: &LogRecord) -> io::Result<()>;

    fn flush(&self) -> io::Result<()>;
}

/// Format a record as one line of the shared log file.
///
/// `myLogger 14:02:11.207     WARN: disk almost full`
pub fn format_record(record: &LogRecord) -> String {
    let time = DateTime::from_timestamp_millis(record.timestamp_ms as i64)
        .map(|utc| utc.with_timezone(&Local).format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "--:--:--.---".to_string());

    format!(
        "{:<8} {} {:>8}: {}",
        record.logger, time, record.level, record.message
    )
}

/// Appends formatted records to a file, truncated when the sink is created.
pub struct FileSink {
    path: PathBuf,
    writer: Mutex<LineWriter<File>>,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(LineWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut LineWriter<File>) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::other("log file writer lock poisoned"))?;
        f(&mut writer)
    }
}

impl RecordSink for FileSink {
    fn append(&self, record: &LogRecord) -> io::Result<()> {
        let line = format_record(record);
        self.with_writer(|writer| writeln!(writer, "{line}"))
    }

    fn flush(&self) -> io::Result<()> {
        self.with_writer(|writer| writer.flush())
    }
}
