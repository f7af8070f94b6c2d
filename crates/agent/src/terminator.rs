//! Process-tree termination
//!
//! Builds are started in their own process group, so the whole group can be
//! signalled at once. Descendants that moved to another group are found
//! through a best-effort process-table snapshot taken before the kill; a
//! process forked after the snapshot may survive.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::error::AgentResult;

/// Stops whatever a supervised command is running
#[async_trait]
pub trait Terminator: Send + Sync {
    /// Forcefully stop the build behind `pid` (the spawned child, if known)
    async fn terminate(&self, pid: Option<u32>);
}

/// Kills the child and every descendant process on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTreeTerminator;

#[async_trait]
impl Terminator for ProcessTreeTerminator {
    async fn terminate(&self, pid: Option<u32>) {
        let Some(pid) = pid else {
            debug!("No pid to terminate");
            return;
        };

        match tokio::task::spawn_blocking(move || kill_tree(pid)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(pid, error = %e, "Failed to kill process tree"),
            Err(e) => warn!(pid, error = %e, "Process tree kill task panicked"),
        }
    }
}

/// Snapshot all descendants of `pid`, breadth first
pub fn descendants(pid: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing(),
    );

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (child, process) in system.processes() {
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(child.as_u32());
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([pid]);
    while let Some(current) = queue.pop_front() {
        if let Some(kids) = children.get(&current) {
            for &kid in kids {
                if kid != pid && !found.contains(&kid) {
                    found.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    found
}

/// Kill `pid`, its process group, and every descendant still running.
///
/// A parent that already exited is not an error.
pub fn kill_tree(pid: u32) -> AgentResult<()> {
    let children = descendants(pid);
    debug!(pid, descendants = ?children, "Killing process tree");

    if !kill_group(pid) && !kill_one(pid) {
        info!(pid, "Process already exited");
    }

    for child in children {
        if is_alive(child) {
            kill_one(child);
        }
    }

    Ok(())
}

#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid as NixPid;

    match killpg(NixPid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, error = %e, "Failed to signal process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> bool {
    false
}

/// Returns false when the process does not exist
#[cfg(unix)]
fn kill_one(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;

    match kill(NixPid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, error = %e, "Failed to kill process");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_one(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(Pid::from_u32(pid))
        .map(|process| process.kill())
        .unwrap_or(false)
}

/// Whether a process with this pid currently exists
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system
        .process(Pid::from_u32(pid))
        .map(|process| !matches!(process.status(), sysinfo::ProcessStatus::Zombie))
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    fn wait_until_dead(pid: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !is_alive(pid) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn test_kill_tree_kills_descendants() {
        // A shell with a background grandchild that would outlive it
        let mut child = Command::new("bash")
            .args(["-c", "sleep 300 & sleep 300 & wait"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut kids = Vec::new();
        while kids.len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
            kids = descendants(pid);
        }
        assert_eq!(kids.len(), 2, "expected two sleep children");

        kill_tree(pid).unwrap();
        child.wait().unwrap();

        for kid in kids {
            assert!(wait_until_dead(kid), "descendant {kid} survived");
        }
    }

    #[test]
    fn test_kill_tree_tolerates_exited_parent() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(kill_tree(pid).is_ok());
    }
}
