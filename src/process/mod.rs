//! Live queries on the OS process table and process tree termination.
//!
//! Nothing is cached: every call takes a fresh snapshot, since PIDs are reused by the OS.

mod inspect;
mod spawn;
mod terminate;

pub use inspect::*;
pub use spawn::*;
pub use terminate::*;
