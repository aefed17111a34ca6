//! Forwards log records to a collector over TCP.
//!
//! Nothing in here may log: the handler is usually installed as a logger itself, a log call from
//! inside it would re-enter the handler while its connection is locked.

use crate::process;
use log::{LevelFilter, Log, Metadata, Record};
use procwatch_shared::{
    DEFAULT_COLLECTOR_HOST, DEFAULT_COLLECTOR_PORT, LogPayload, LogRecord, ShutdownRequest,
    encode_frame,
};
use simplelog::SharedLogger;
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Logger name written in front of every record
    pub name: String,
    /// Make this handler the default of the registry it is registered in
    pub is_default: bool,
    pub level: LevelFilter,
    pub host: String,
    pub port: u16,
}

impl HandlerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_default: false,
            level: LevelFilter::Info,
            host: DEFAULT_COLLECTOR_HOST.to_string(),
            port: DEFAULT_COLLECTOR_PORT,
        }
    }

    pub fn with_default(self, is_default: bool) -> Self {
        Self { is_default, ..self }
    }

    pub fn with_level(self, level: LevelFilter) -> Self {
        Self { level, ..self }
    }

    pub fn with_host(self, host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..self
        }
    }

    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }
}

struct Retry {
    at: Instant,
    delay: Duration,
}

#[derive(Default)]
struct Connection {
    stream: Option<TcpStream>,
    retry: Option<Retry>,
}

fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host} does not resolve to any address"),
        )
    }))
}

impl Connection {
    fn stream(&mut self, config: &HandlerConfig) -> io::Result<&mut TcpStream> {
        if self.stream.is_none() {
            if let Some(retry) = &self.retry {
                if Instant::now() < retry.at {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "collector unreachable, waiting before reconnecting",
                    ));
                }
            }

            match connect(&config.host, config.port) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.stream = Some(stream);
                    self.retry = None;
                }
                Err(e) => {
                    let delay = self
                        .retry
                        .as_ref()
                        .map_or(INITIAL_RETRY_DELAY, |retry| {
                            (retry.delay * 2).min(MAX_RETRY_DELAY)
                        });
                    self.retry = Some(Retry {
                        at: Instant::now() + delay,
                        delay,
                    });
                    return Err(e);
                }
            }
        }

        self.stream
            .as_mut()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }

    fn write_frame(&mut self, config: &HandlerConfig, frame: &[u8]) -> io::Result<()> {
        let stream = self.stream(config)?;
        if let Err(e) = stream.write_all(frame) {
            // reconnect on the next record
            self.stream = None;
            return Err(e);
        }
        Ok(())
    }
}

/// A logger that ships its records to a log collector.
///
/// Connects on the first record and keeps the connection open. When the collector cannot be
/// reached, records are dropped and counted until the next reconnection attempt, with a delay
/// growing from [`INITIAL_RETRY_DELAY`] to [`MAX_RETRY_DELAY`].
pub struct CollectorHandler {
    config: HandlerConfig,
    connection: Mutex<Connection>,
    dropped: AtomicU64,
}

impl CollectorHandler {
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(Connection::default()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Frame and write a payload to the collector.
    pub fn send(&self, payload: &LogPayload) -> io::Result<()> {
        let result = encode_frame(payload)
            .map_err(io::Error::other)
            .and_then(|frame| self.connection().write_frame(&self.config, &frame));

        if result.is_err() && !payload.is_shutdown() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Send a record with this handler's name, if `level` passes its filter.
    pub fn emit(&self, level: log::Level, message: impl Into<String>) -> io::Result<()> {
        if level > self.config.level {
            return Ok(());
        }
        self.send(&LogPayload::Record(LogRecord::new(
            self.config.name.as_str(),
            level.into(),
            message,
        )))
    }

    /// Ask the collector to stop, without waiting for it.
    pub fn send_shutdown(&self) -> io::Result<()> {
        let result = self.send(&LogPayload::Shutdown(ShutdownRequest {
            requester: self.config.name.clone(),
            pid: std::process::id(),
        }));
        self.close();
        result
    }

    /// Ask the collector to stop, then wait up to `timeout` for process `collector_pid` to exit.
    ///
    /// Returns whether the collector is gone.
    pub fn request_shutdown(&self, collector_pid: u32, timeout: Duration) -> bool {
        // the collector may be gone already, which the polling below tells
        let _ = self.send_shutdown();

        let deadline = Instant::now() + timeout;
        loop {
            match process::exists(collector_pid) {
                Ok(false) => return true,
                Ok(true) => {}
                Err(_) => return false,
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
    }

    /// Records lost because the collector could not be reached.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the connection, the next record opens a new one.
    pub fn close(&self) {
        self.connection().stream = None;
    }

    /// A boxed logger sharing this handler, for [`simplelog::CombinedLogger`].
    pub fn shared_logger(self: &Arc<Self>) -> Box<dyn SharedLogger> {
        Box::new(SharedHandler(Arc::clone(self)))
    }
}

impl Log for CollectorHandler {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Failures are counted in `dropped_records`
        let _ = self.send(&LogPayload::Record(LogRecord::from_log(
            &self.config.name,
            record,
        )));
    }

    fn flush(&self) {
        if let Some(stream) = self.connection().stream.as_mut() {
            let _ = stream.flush();
        }
    }
}

impl SharedLogger for CollectorHandler {
    fn level(&self) -> LevelFilter {
        self.config.level
    }

    fn config(&self) -> Option<&simplelog::Config> {
        None
    }

    fn as_log(self: Box<Self>) -> Box<dyn Log> {
        Box::new(*self)
    }
}

struct SharedHandler(Arc<CollectorHandler>);

impl Log for SharedHandler {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.0.log(record)
    }

    fn flush(&self) {
        Log::flush(self.0.as_ref())
    }
}

impl SharedLogger for SharedHandler {
    fn level(&self) -> LevelFilter {
        self.0.config.level
    }

    fn config(&self) -> Option<&simplelog::Config> {
        None
    }

    fn as_log(self: Box<Self>) -> Box<dyn Log> {
        Box::new(*self)
    }
}
