use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind,
};

/// Refresh a single process and hand it to `f`.
///
/// Fails with [`Error::ProcessNotFound`] when the PID is not in the process table, or only
/// survives as a zombie.
fn with_process<T>(
    pid: u32,
    refresh: ProcessRefreshKind,
    f: impl FnOnce(&Process) -> T,
) -> Result<T> {
    if pid == 0 {
        return Err(Error::invalid_pid());
    }

    let sys_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[sys_pid]), true, refresh);

    system
        .process(sys_pid)
        .filter(|process| is_alive(process))
        .map(f)
        .ok_or(Error::ProcessNotFound { pid })
}

/// Snapshot of the whole process table.
fn snapshot() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing(),
    );
    system
}

fn is_alive(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn is_thread(process: &Process) -> bool {
    process.thread_kind().is_some()
}

/// Name of the process, as reported by the OS.
pub fn name(pid: u32) -> Result<String> {
    with_process(pid, ProcessRefreshKind::nothing(), |process| {
        process.name().to_string_lossy().into_owned()
    })
}

/// Path of the executable image, when the OS lets us read it.
pub fn executable(pid: u32) -> Result<Option<PathBuf>> {
    with_process(
        pid,
        ProcessRefreshKind::nothing().with_exe(UpdateKind::Always),
        |process| process.exe().map(PathBuf::from),
    )
}

/// Command line of the process, argument 0 replaced by the resolved executable path when known.
pub fn command_line(pid: u32) -> Result<Vec<String>> {
    with_process(
        pid,
        ProcessRefreshKind::nothing()
            .with_exe(UpdateKind::Always)
            .with_cmd(UpdateKind::Always),
        |process| {
            let mut args: Vec<String> = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();

            if let Some(exe) = process.exe() {
                let exe = exe.to_string_lossy().into_owned();
                match args.first_mut() {
                    Some(arg0) => *arg0 = exe,
                    None => args.push(exe),
                }
            }
            args
        },
    )
}

/// Whether `pid` currently refers to a running process. Zombies are not running.
pub fn exists(pid: u32) -> Result<bool> {
    match with_process(pid, ProcessRefreshKind::nothing(), |_| ()) {
        Ok(()) => Ok(true),
        Err(Error::ProcessNotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn parent(pid: u32) -> Result<Option<u32>> {
    with_process(pid, ProcessRefreshKind::nothing(), |process| {
        process.parent().map(|parent| parent.as_u32())
    })
}

/// All descendants of `pid`, direct children first.
///
/// The tree is computed from a single process table snapshot. Empty if `pid` has no children or
/// does not exist anymore.
pub fn children(pid: u32) -> Vec<u32> {
    if pid == 0 {
        return Vec::new();
    }
    let system = snapshot();

    let mut children_of: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (child, process) in system.processes() {
        if is_thread(process) || !is_alive(process) {
            continue;
        }
        if let Some(parent) = process.parent() {
            children_of.entry(parent).or_default().push(*child);
        }
    }

    let root = Pid::from_u32(pid);
    let mut visited = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    let mut descendants = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(direct) = children_of.get_mut(&current) else {
            continue;
        };
        direct.sort_unstable();
        for child in direct.iter() {
            // A PID reused while we walk could in theory close a cycle
            if visited.insert(*child) {
                descendants.push(child.as_u32());
                queue.push_back(*child);
            }
        }
    }

    descendants
}

/// PIDs of live processes named `name_filter`, compared case-insensitively, sorted.
pub fn list_alive(name_filter: &str) -> Vec<u32> {
    let system = snapshot();
    let mut pids: Vec<u32> = system
        .processes()
        .values()
        .filter(|process| !is_thread(process) && is_alive(process))
        .filter(|process| {
            process
                .name()
                .to_string_lossy()
                .eq_ignore_ascii_case(name_filter)
        })
        .map(|process| process.pid().as_u32())
        .collect();
    pids.sort_unstable();
    pids
}

/// PIDs present in `after` but not in `before`, in `after` order.
pub fn new_pids(before: &[u32], after: &[u32]) -> Vec<u32> {
    let before: HashSet<&u32> = before.iter().collect();
    after
        .iter()
        .filter(|pid| !before.contains(pid))
        .copied()
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub parent: Option<u32>,
    pub executable: Option<PathBuf>,
    pub command_line: Vec<String>,
    pub children: Vec<u32>,
}

/// Everything known about a process, gathered in one refresh.
pub fn info(pid: u32) -> Result<ProcessInfo> {
    let mut info = with_process(
        pid,
        ProcessRefreshKind::nothing()
            .with_exe(UpdateKind::Always)
            .with_cmd(UpdateKind::Always),
        |process| ProcessInfo {
            pid,
            name: process.name().to_string_lossy().into_owned(),
            parent: process.parent().map(|parent| parent.as_u32()),
            executable: process.exe().map(PathBuf::from),
            command_line: process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
            children: Vec::new(),
        },
    )?;
    info.children = children(pid);
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, Command};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Kills and reaps the wrapped child when dropped, so failed assertions leave nothing behind.
    struct ChildGuard(Child);

    impl Drop for ChildGuard {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    fn wait_for_children(pid: u32, expected: usize) -> Vec<u32> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let found = children(pid);
            if found.len() >= expected || Instant::now() > deadline {
                return found;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn test_current_process_is_inspectable() {
        let pid = std::process::id();

        assert!(exists(pid).unwrap());
        assert!(!name(pid).unwrap().is_empty());
        assert_eq!(parent(pid).unwrap(), Some(std::os::unix::process::parent_id()));

        let exe = executable(pid).unwrap().unwrap();
        assert_eq!(
            exe.file_name(),
            std::env::current_exe().unwrap().file_name()
        );
        let cmd = command_line(pid).unwrap();
        assert_eq!(cmd.first().map(PathBuf::from), Some(exe));
    }

    #[test]
    fn test_pid_zero_is_rejected() {
        assert!(matches!(exists(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(name(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_exited_process_does_not_exist() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(!exists(pid).unwrap());
        assert!(matches!(name(pid), Err(Error::ProcessNotFound { pid: p }) if p == pid));
        assert!(children(pid).is_empty());
    }

    #[test]
    fn test_unreaped_child_counts_as_dead() {
        let child = ChildGuard(Command::new("true").spawn().unwrap());
        let pid = child.0.id();

        let deadline = Instant::now() + Duration::from_secs(5);
        while exists(pid).unwrap() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!exists(pid).unwrap());
    }

    #[test]
    fn test_children_are_found_recursively() {
        let shell = ChildGuard(
            Command::new("sh")
                .args(["-c", "sleep 30 & sh -c 'sleep 30 & wait' & wait"])
                .spawn()
                .unwrap(),
        );

        // sleep, inner sh, and the inner sleep
        let found = wait_for_children(shell.0.id(), 3);
        assert_eq!(found.len(), 3, "found {found:?}");
        assert!(!found.contains(&shell.0.id()));

        let direct: Vec<u32> = found
            .iter()
            .copied()
            .filter(|pid| parent(*pid).ok().flatten() == Some(shell.0.id()))
            .collect();
        assert_eq!(direct.len(), 2);
        assert_eq!(&found[..2], direct.as_slice());

        for pid in &found {
            let _ = Command::new("kill").arg(pid.to_string()).status();
        }
    }

    #[test]
    fn test_list_alive_ignores_case() {
        let child = ChildGuard(Command::new("sleep").arg("30").spawn().unwrap());
        let pid = child.0.id();

        assert!(list_alive("sleep").contains(&pid));
        assert!(list_alive("SLEEP").contains(&pid));
        assert!(!list_alive("slee").contains(&pid));
    }

    #[test]
    fn test_new_pids() {
        assert_eq!(new_pids(&[1, 2, 3], &[2, 3, 4, 5]), vec![4, 5]);
        assert!(new_pids(&[1, 2], &[1]).is_empty());
    }

    #[test]
    fn test_info_serializes() {
        let info = info(std::process::id()).unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["pid"], std::process::id());
        assert_eq!(json["name"], info.name);
    }
}
