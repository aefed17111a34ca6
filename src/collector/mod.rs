//! Log collector: a TCP server writing the records of many processes to one file.

mod connection;
mod launch;
mod server;
mod sink;

pub use connection::{ConnectionOutcome, ConnectionReport, handle_connection, read_frame};
pub use launch::{
    COLLECTOR_SPAWN_TIMEOUT, SERVE_SUBCOMMAND, is_port_free, run_collector, spawn_collector,
};
pub use server::{CollectorServer, CollectorStats, SHUTDOWN_GRACE};
pub use sink::{FileSink, RecordSink, format_record};
