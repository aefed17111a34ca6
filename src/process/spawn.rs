use crate::error::{Error, Result};
use log::{debug, trace};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::{env, thread};

/// Overrides the binary used to run the hidden helper subcommands.
pub const PROCWATCH_BIN_ENV: &str = "PROCWATCH_BIN";

/// Runs `procwatch` subcommands (the watchdog timer, the collector) as separate processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    program: PathBuf,
}

impl Launcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Use `$PROCWATCH_BIN` if set, or the currently running executable.
    ///
    /// Library users whose executable is not `procwatch` must set the variable or use
    /// [`Launcher::new`].
    pub fn from_env() -> Result<Self> {
        if let Some(program) = env::var_os(PROCWATCH_BIN_ENV) {
            return Ok(Self::new(program));
        }
        Ok(Self::new(env::current_exe()?))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Spawn `program args...` detached, returning its PID.
    pub fn spawn<I, S>(&self, args: I) -> Result<u32>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        spawn_detached(&self.program, args)
    }
}

/// Spawn a process that does not share our stdin nor our process group.
///
/// The child is waited for on a background thread, so it never lingers as a zombie once it
/// exits, and its PID is free to be checked with [`super::exists`].
pub fn spawn_detached<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<u32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Ctrl-C in the terminal of the parent must not reach the child
        cmd.process_group(0);
    }

    debug!("Spawning detached process: {cmd:?}");
    let mut child = cmd.spawn().map_err(|source| Error::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
    })?;
    let pid = child.id();

    thread::spawn(move || match child.wait() {
        Ok(status) => trace!("Detached process {pid} exited with {status}"),
        Err(e) => debug!("Failed to wait for detached process {pid}: {e}"),
    });

    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{exists, kill};
    use std::time::{Duration, Instant};

    #[test]
    fn test_detached_child_is_reaped() {
        let pid = spawn_detached("sleep", ["0.2"]).unwrap();
        assert!(exists(pid).unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        while exists(pid).unwrap() {
            assert!(Instant::now() < deadline, "process {pid} never went away");
            thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn test_missing_program_is_a_spawn_error() {
        let launcher = Launcher::new("/nonexistent/procwatch");
        match launcher.spawn(["serve"]) {
            Err(Error::Spawn { program, .. }) => assert_eq!(program, "/nonexistent/procwatch"),
            other => panic!("Expected a spawn error, got {other:?}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_detached_child_has_its_own_group() {
        let pid = spawn_detached("sleep", ["30"]).unwrap();

        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
        // Fields after the command name: state, ppid, pgrp, ...
        let (_, fields) = stat.rsplit_once(')').unwrap();
        let pgrp: u32 = fields.split_whitespace().nth(2).unwrap().parse().unwrap();
        assert_eq!(pgrp, pid);

        assert!(kill(pid, Default::default()).unwrap());
    }
}
