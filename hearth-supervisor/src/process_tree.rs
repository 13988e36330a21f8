//! Process tree enumeration and signalling
//!
//! Game launchers routinely fork the real server (shell wrappers, Steam
//! runtimes), so stopping only the root PID leaves orphans. We snapshot the
//! process table, walk parent links down from the root, and signal every
//! member, leaves first and the root last.

use std::collections::{HashMap, HashSet, VecDeque};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Signal escalation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    /// SIGTERM: ask politely
    Terminate,
    /// SIGKILL: no appeal
    Kill,
}

/// Outcome of signalling a tree
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SignalReport {
    /// PIDs the signal was delivered to
    pub signalled: Vec<u32>,
    /// PIDs that were already gone
    pub vanished: Vec<u32>,
    /// PIDs that could not be signalled
    pub failed: Vec<u32>,
}

/// Every descendant of `root`, breadth-first (children before grandchildren)
pub fn descendants(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }

    let mut out = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        if let Some(kids) = children.get(&current) {
            for &kid in kids {
                if seen.insert(kid) {
                    out.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    out
}

/// Signal `root` and all its descendants; individual failures are logged and swallowed.
///
/// Blocking: takes a full process table snapshot. Call from `spawn_blocking`.
pub fn signal_tree(worker_id: &str, root: u32, signal: TreeSignal) -> SignalReport {
    let mut members = descendants(root);
    members.reverse();
    members.push(root);

    let mut report = SignalReport::default();
    for pid in members {
        match send(pid, signal) {
            Ok(true) => report.signalled.push(pid),
            Ok(false) => report.vanished.push(pid),
            Err(e) => {
                warn!(worker_id = %worker_id, pid, ?signal, error = %e, "Failed to signal process tree member");
                report.failed.push(pid);
            }
        }
    }
    debug!(
        worker_id = %worker_id,
        root,
        ?signal,
        signalled = report.signalled.len(),
        vanished = report.vanished.len(),
        failed = report.failed.len(),
        "Signalled process tree"
    );
    report
}

/// Deliver one signal; `Ok(false)` means the process no longer exists
#[cfg(unix)]
fn send(pid: u32, signal: TreeSignal) -> Result<bool, String> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;

    let raw = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    let sig = match signal {
        TreeSignal::Terminate => Signal::SIGTERM,
        TreeSignal::Kill => Signal::SIGKILL,
    };
    match signal::kill(NixPid::from_raw(raw), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(not(unix))]
fn send(pid: u32, signal: TreeSignal) -> Result<bool, String> {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::new(),
    );
    let Some(process) = system.process(target) else {
        return Ok(false);
    };
    let delivered = match signal {
        TreeSignal::Terminate => process
            .kill_with(sysinfo::Signal::Term)
            .unwrap_or_else(|| process.kill()),
        TreeSignal::Kill => process.kill(),
    };
    if delivered {
        Ok(true)
    } else {
        Err("kill request refused".to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use sysinfo::Pid;

    #[tokio::test]
    async fn test_descendants_and_kill_whole_tree() {
        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30 & wait")
            .spawn()
            .unwrap();
        let root = child.id().unwrap();

        // Give the shell a moment to fork its children.
        let mut kids = Vec::new();
        for _ in 0..50 {
            kids = tokio::task::spawn_blocking(move || descendants(root)).await.unwrap();
            if kids.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(kids.len() >= 2, "expected two sleep children, got {kids:?}");
        assert!(!kids.contains(&root));

        let report = tokio::task::spawn_blocking(move || signal_tree("test", root, TreeSignal::Kill))
            .await
            .unwrap();
        assert_eq!(report.signalled.last(), Some(&root));
        assert!(report.failed.is_empty());

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("root should exit after SIGKILL")
            .unwrap();
        assert!(!status.success());

        // Children were signalled too; give the kernel a moment to reap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        for kid in kids {
            let alive = tokio::task::spawn_blocking(move || {
                let mut system = System::new();
                system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[Pid::from_u32(kid)]),
                    true,
                    ProcessRefreshKind::new(),
                );
                system
                    .process(Pid::from_u32(kid))
                    .map(|p| !matches!(p.status(), sysinfo::ProcessStatus::Zombie))
                    .unwrap_or(false)
            })
            .await
            .unwrap();
            assert!(!alive, "descendant {kid} survived");
        }
    }

    #[test]
    fn test_signal_vanished_pid() {
        // PID near the 32-bit ceiling is never allocated in practice.
        let report = signal_tree("test", 2_000_000_000, TreeSignal::Terminate);
        assert!(report.signalled.is_empty());
        assert_eq!(report.vanished, vec![2_000_000_000]);
    }
}
