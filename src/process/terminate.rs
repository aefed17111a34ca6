use super::inspect::{children, exists, list_alive};
use crate::error::{Error, Result};
use log::{debug, warn};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System};

pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(3);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long a process gets to disappear after SIGKILL
const FORCE_KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillOptions {
    /// Return an error instead of `false` when a process survives
    pub raise_on_failure: bool,
    /// How long to wait for the process to exit after the termination request. Zero means
    /// "request and return".
    pub timeout: Duration,
}

impl Default for KillOptions {
    fn default() -> Self {
        Self {
            raise_on_failure: true,
            timeout: DEFAULT_KILL_TIMEOUT,
        }
    }
}

impl KillOptions {
    pub fn no_raise() -> Self {
        Self {
            raise_on_failure: false,
            ..Default::default()
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let sys_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::nothing(),
    );

    let Some(process) = system.process(sys_pid) else {
        debug!("Process {pid} exited before {signal:?} could be sent");
        return Ok(());
    };

    // `None` when the platform has no such signal, fall back to its native kill
    let delivered = process.kill_with(signal).unwrap_or_else(|| process.kill());
    if delivered || !exists(pid)? {
        return Ok(());
    }

    Err(Error::KillFailed {
        pid,
        reason: format!("{signal:?} could not be delivered"),
    })
}

/// Poll until `pid` is gone. Returns whether it exited within `timeout`.
fn wait_for_exit(pid: u32, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if !exists(pid)? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn terminate(pid: u32, timeout: Duration) -> Result<()> {
    debug!("Sending SIGTERM to process {pid}");
    send_signal(pid, Signal::Term)?;
    if timeout.is_zero() || wait_for_exit(pid, timeout)? {
        return Ok(());
    }

    debug!("Process {pid} still alive after {timeout:?}, sending SIGKILL");
    send_signal(pid, Signal::Kill)?;
    if wait_for_exit(pid, FORCE_KILL_GRACE)? {
        return Ok(());
    }

    Err(Error::KillTimeout { pid, timeout })
}

/// Terminate a single process.
///
/// Returns `Ok(true)` right away if the process does not exist. Otherwise the process is asked to
/// terminate, then force killed if it is still alive after `options.timeout`.
pub fn kill(pid: u32, options: KillOptions) -> Result<bool> {
    if pid == 0 {
        return Err(Error::invalid_pid());
    }
    if !exists(pid)? {
        return Ok(true);
    }

    match terminate(pid, options.timeout) {
        Ok(()) => Ok(true),
        Err(e) if options.raise_on_failure => Err(e),
        Err(e) => {
            warn!("{e}");
            Ok(false)
        }
    }
}

/// Run `kill_one` on every pid, whatever happens to the previous ones, and report the first error.
fn kill_each(pids: &[u32], mut kill_one: impl FnMut(u32) -> Result<bool>) -> Result<()> {
    let mut first_error = None;
    for &pid in pids {
        if let Err(e) = kill_one(pid) {
            debug!("Failed to kill process {pid}: {e}");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Descendants of `pid`, deepest first.
fn kill_order(pid: u32) -> Vec<u32> {
    let mut descendants = children(pid);
    descendants.reverse();
    descendants
}

/// Kill every descendant of `pid`, but not `pid` itself. Returns the PIDs in the order they were
/// attempted.
pub fn kill_children(pid: u32, options: KillOptions) -> Result<Vec<u32>> {
    if pid == 0 {
        return Err(Error::invalid_pid());
    }

    let pids = kill_order(pid);
    kill_each(&pids, |child| kill(child, options))?;
    Ok(pids)
}

fn kill_tree_inner(pid: u32, options: KillOptions) -> (Vec<u32>, Result<()>) {
    if pid == 0 {
        return (Vec::new(), Err(Error::invalid_pid()));
    }

    let mut pids = kill_order(pid);
    pids.push(pid);
    let result = kill_each(&pids, |target| kill(target, options));
    (pids, result)
}

/// Kill `pid` and all of its descendants, children first and `pid` last.
pub fn kill_tree(pid: u32, options: KillOptions) -> Result<Vec<u32>> {
    let (pids, result) = kill_tree_inner(pid, options);
    result.map(|()| pids)
}

/// [`kill_tree`] on each root. Every root is attempted before the first error is reported.
///
/// On failure the error is [`Error::TreeKillFailed`], carrying every PID that was attempted.
pub fn kill_tree_multiple(roots: &[u32], options: KillOptions) -> Result<Vec<u32>> {
    let mut attempted = Vec::new();
    let mut first_error = None;

    for &root in roots {
        let (pids, result) = kill_tree_inner(root, options);
        attempted.extend(pids);
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(Error::TreeKillFailed {
            attempted,
            source: Box::new(e),
        }),
        None => Ok(attempted),
    }
}

/// Kill the trees of every process named `name_filter`. The calling process is spared.
pub fn kill_by_name(name_filter: &str, options: KillOptions) -> Result<Vec<u32>> {
    let own_pid = std::process::id();
    let roots: Vec<u32> = list_alive(name_filter)
        .into_iter()
        .filter(|pid| *pid != own_pid)
        .collect();
    debug!("Processes matching {name_filter:?}: {roots:?}");

    kill_tree_multiple(&roots, options)
}
