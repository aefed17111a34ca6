use std::{io, time::Duration};

/// Errors surfaced by the library APIs.
///
/// OS level failures never escape raw, they are mapped to one of these variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("process {pid} does not exist")]
    ProcessNotFound { pid: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("process {pid} still alive {timeout:?} after termination was requested")]
    KillTimeout { pid: u32, timeout: Duration },

    #[error("failed to kill process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{} processes attempted, first failure: {source}", .attempted.len())]
    TreeKillFailed {
        attempted: Vec<u32>,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn invalid_pid() -> Self {
        Error::InvalidArgument("pid must not be 0".to_string())
    }
}
