//! procwatch library
//!
//! Process tree supervision with an out-of-process watchdog, plus a TCP log collector fed by
//! [`client::CollectorHandler`]s.

pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod process;
pub mod watchdog;

mod prelude;

pub use error::{Error, Result};
pub use procwatch_shared as shared;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
