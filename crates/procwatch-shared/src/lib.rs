//! Wire types shared between log producers and the log collector.
//!
//! WARNING: Producers and the collector must agree on this crate's version, the payload
//! encoding is not self-describing.

pub mod frame;
pub mod record;

pub use frame::{FrameError, decode_frame, encode_frame, write_frame};
pub use record::{LogLevel, LogPayload, LogRecord, ShutdownRequest};

/// Port the log collector listens on when none is configured.
pub const DEFAULT_COLLECTOR_PORT: u16 = 9020;

/// Collectors only listen on the loopback interface.
pub const DEFAULT_COLLECTOR_HOST: &str = "127.0.0.1";
