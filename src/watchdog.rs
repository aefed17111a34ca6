//! Out-of-process watchdog.
//!
//! The timer runs in its own process (`procwatch watchdog-timer`), so it still fires when the
//! supervising process crashes or hangs.

use crate::error::{Error, Result};
use crate::process::{self, KillOptions, Launcher};
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;

/// Hidden CLI subcommand running the timer.
pub const TIMER_SUBCOMMAND: &str = "watchdog-timer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// Not started yet
    Idle,
    /// The timer process is counting down
    Running,
    /// The timer is gone and so is the target
    Expired,
    /// [`Watchdog::stop`] was called
    Stopped,
    /// The timer is gone but the target is still alive, the timer was killed by someone else
    TimerLost,
}

#[derive(Debug)]
pub struct Watchdog {
    target_pid: u32,
    timeout: Duration,
    launcher: Launcher,
    timer_pid: Option<u32>,
    stopped: bool,
}

impl Watchdog {
    /// Watch `target_pid`, using the current executable to run the timer.
    pub fn new(target_pid: u32, timeout: Duration) -> Result<Self> {
        Self::with_launcher(target_pid, timeout, Launcher::from_env()?)
    }

    pub fn with_launcher(target_pid: u32, timeout: Duration, launcher: Launcher) -> Result<Self> {
        if target_pid == 0 {
            return Err(Error::invalid_pid());
        }
        if timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "watchdog timeout must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            target_pid,
            timeout,
            launcher,
            timer_pid: None,
            stopped: false,
        })
    }

    pub fn target_pid(&self) -> u32 {
        self.target_pid
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    /// Timeout in whole minutes, rounded down.
    pub fn timeout_mins(&self) -> u64 {
        self.timeout.as_secs() / 60
    }

    /// PID of the timer process, once started.
    pub fn timer_pid(&self) -> Option<u32> {
        self.timer_pid
    }

    /// Spawn the timer process. A watchdog can only be started once.
    pub fn start(&mut self) -> Result<u32> {
        if self.timer_pid.is_some() || self.stopped {
            return Err(Error::InvalidArgument(format!(
                "watchdog for process {} was already started",
                self.target_pid
            )));
        }

        let timeout_ms = self.timeout.as_millis().to_string();
        let target = self.target_pid.to_string();
        let timer_pid = self.launcher.spawn([
            TIMER_SUBCOMMAND,
            "--pid",
            target.as_str(),
            "--timeout-ms",
            timeout_ms.as_str(),
        ])?;
        debug!(
            "Watchdog timer {timer_pid} started for process {} ({:?})",
            self.target_pid, self.timeout
        );

        self.timer_pid = Some(timer_pid);
        Ok(timer_pid)
    }

    /// Disarm the watchdog by killing its timer. Calling it again, or before `start`, does nothing.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(timer_pid) = self.timer_pid {
            if let Ok(false) = process::kill(timer_pid, KillOptions::no_raise()) {
                warn!("Watchdog timer {timer_pid} could not be stopped");
            }
        }
    }

    pub fn is_timer_alive(&self) -> bool {
        self.timer_pid
            .is_some_and(|pid| process::exists(pid).unwrap_or(false))
    }

    pub fn is_target_alive(&self) -> bool {
        process::exists(self.target_pid).unwrap_or(false)
    }

    /// Whether the timer has fired and the target is gone.
    ///
    /// Only inferred from both processes being dead: a target that exited on its own, before
    /// `start` or after `stop`, also reads as expired. Use [`Watchdog::state`] to tell those apart.
    pub fn is_expired(&self) -> bool {
        !self.is_timer_alive() && !self.is_target_alive()
    }

    pub fn state(&self) -> WatchdogState {
        if self.stopped {
            return WatchdogState::Stopped;
        }
        if self.timer_pid.is_none() {
            return WatchdogState::Idle;
        }
        if self.is_timer_alive() {
            return WatchdogState::Running;
        }
        if self.is_target_alive() {
            WatchdogState::TimerLost
        } else {
            WatchdogState::Expired
        }
    }
}

/// Body of the timer process: wait for `timeout`, then kill the tree of `target_pid`.
///
/// Returns the PIDs that were attempted, empty if the target was already gone.
pub fn run_timer(target_pid: u32, timeout: Duration) -> Result<Vec<u32>> {
    if target_pid == 0 {
        return Err(Error::invalid_pid());
    }

    debug!("Watchdog armed for process {target_pid}, firing in {timeout:?}");
    thread::sleep(timeout);

    if !process::exists(target_pid)? {
        debug!("Process {target_pid} already exited, nothing to kill");
        return Ok(Vec::new());
    }

    info!("Watchdog expired after {timeout:?}, killing process tree of {target_pid}");
    process::kill_tree(target_pid, KillOptions::no_raise())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::process::Command;

    fn watchdog(timeout: Duration) -> Watchdog {
        Watchdog::with_launcher(std::process::id(), timeout, Launcher::new("procwatch")).unwrap()
    }

    #[test]
    fn test_rejects_invalid_arguments() {
        let launcher = Launcher::new("procwatch");
        assert!(matches!(
            Watchdog::with_launcher(0, Duration::from_secs(1), launcher.clone()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Watchdog::with_launcher(std::process::id(), Duration::ZERO, launcher),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[rstest]
    #[case(Duration::from_millis(1500), 1, 0)]
    #[case(Duration::from_secs(59), 59, 0)]
    #[case(Duration::from_secs(150), 150, 2)]
    fn test_timeout_accessors(#[case] timeout: Duration, #[case] secs: u64, #[case] mins: u64) {
        let watchdog = watchdog(timeout);
        assert_eq!(watchdog.timeout(), timeout);
        assert_eq!(watchdog.timeout_secs(), secs);
        assert_eq!(watchdog.timeout_mins(), mins);
    }

    #[test]
    fn test_idle_watchdog() {
        let mut watchdog = watchdog(Duration::from_secs(1));
        assert_eq!(watchdog.state(), WatchdogState::Idle);
        assert!(!watchdog.is_timer_alive());
        assert!(!watchdog.is_expired());
        assert!(watchdog.is_target_alive());

        watchdog.stop();
        watchdog.stop();
        assert_eq!(watchdog.state(), WatchdogState::Stopped);
        assert!(watchdog.start().is_err());
    }

    #[test]
    fn test_dead_target_reads_as_expired_before_start() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let watchdog =
            Watchdog::with_launcher(pid, Duration::from_secs(1), Launcher::new("procwatch"))
                .unwrap();
        assert!(!watchdog.is_timer_alive());
        assert!(!watchdog.is_target_alive());
        assert!(watchdog.is_expired());
        assert_eq!(watchdog.state(), WatchdogState::Idle);
    }

    #[test]
    fn test_failed_spawn_leaves_watchdog_idle() {
        let mut watchdog = Watchdog::with_launcher(
            std::process::id(),
            Duration::from_secs(1),
            Launcher::new("/nonexistent/procwatch"),
        )
        .unwrap();

        assert!(matches!(watchdog.start(), Err(Error::Spawn { .. })));
        assert_eq!(watchdog.state(), WatchdogState::Idle);
    }

    #[test_log::test]
    fn test_timer_kills_target_tree() {
        let target = Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap()
            .id();

        let killed = run_timer(target, Duration::from_millis(300)).unwrap();

        assert_eq!(killed.last(), Some(&target));
        for pid in killed {
            assert!(!process::exists(pid).unwrap());
        }
    }

    #[test]
    fn test_timer_ignores_exited_target() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(run_timer(pid, Duration::from_millis(10)).unwrap().is_empty());
    }
}
