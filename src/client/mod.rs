//! Client side of the log collector.

mod handler;
pub mod registry;

pub use handler::{
    CONNECT_TIMEOUT, CollectorHandler, HandlerConfig, INITIAL_RETRY_DELAY, MAX_RETRY_DELAY,
};
pub use registry::HandlerRegistry;
