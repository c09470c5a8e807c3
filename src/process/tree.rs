//! Recursive termination of a process and everything it spawned.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::models::error::TerminationError;

/// Parent pid to child pids, taken from one snapshot of the process table.
pub type ProcessTable = HashMap<u32, Vec<u32>>;

/// Kills `pid` and all of its descendants, children before parents.
///
/// A process that is already gone counts as killed. Pid 0 is never touched.
/// Without a usable process table only `pid` itself is killed.
pub fn kill_tree(pid: u32) -> Result<(), TerminationError> {
    if pid == 0 {
        return Ok(());
    }

    let order = match snapshot() {
        Some(table) => kill_order(pid, &table),
        None => {
            warn!("Process table unavailable, killing only process {}.", pid);
            vec![pid]
        }
    };

    let mut result = Ok(());
    for target in order {
        match kill_one(target) {
            Ok(()) | Err(TerminationError::AlreadyExited(_)) => {}
            Err(e) if target == pid => result = Err(e),
            Err(e) => warn!("{}", e),
        }
    }
    result
}

/// Depth-first post-order over the subtree rooted at `root`.
pub fn kill_order(root: u32, table: &ProcessTable) -> Vec<u32> {
    fn visit(pid: u32, table: &ProcessTable, seen: &mut HashSet<u32>, order: &mut Vec<u32>) {
        if pid == 0 || !seen.insert(pid) {
            return;
        }
        if let Some(children) = table.get(&pid) {
            for &child in children {
                visit(child, table, seen, order);
            }
        }
        order.push(pid);
    }

    let mut order = Vec::new();
    visit(root, table, &mut HashSet::new(), &mut order);
    order
}

fn snapshot() -> Option<ProcessTable> {
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        return None;
    }

    let mut system = System::new_with_specifics(RefreshKind::nothing());
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());

    let mut table = ProcessTable::new();
    for (pid, process) in system.processes() {
        // Threads share their process' pid space on Linux; skip them.
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            table.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }
    for children in table.values_mut() {
        children.sort_unstable();
    }
    Some(table)
}

/// Kills every process in the group led by `pgid`.
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> Result<(), TerminationError> {
    if pgid == 0 {
        return Ok(());
    }
    let raw = libc::pid_t::try_from(pgid).map_err(|_| TerminationError::AlreadyExited(pgid))?;
    let rc = unsafe { libc::killpg(raw, libc::SIGKILL) };
    if rc == 0 {
        debug!("Killed process group {}.", pgid);
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Err(TerminationError::AlreadyExited(pgid))
    } else {
        Err(TerminationError::Signal { pid: pgid, source: err })
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pgid: u32) -> Result<(), TerminationError> {
    Ok(())
}

#[cfg(unix)]
fn kill_one(pid: u32) -> Result<(), TerminationError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| TerminationError::AlreadyExited(pid))?;
    let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
    if rc == 0 {
        debug!("Killed process {}.", pid);
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Err(TerminationError::AlreadyExited(pid))
    } else {
        Err(TerminationError::Signal { pid, source: err })
    }
}

#[cfg(not(unix))]
fn kill_one(pid: u32) -> Result<(), TerminationError> {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new_with_specifics(RefreshKind::nothing());
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    match system.process(target) {
        None => Err(TerminationError::AlreadyExited(pid)),
        Some(process) if process.kill() => {
            debug!("Killed process {}.", pid);
            Ok(())
        }
        Some(_) => Err(TerminationError::Signal {
            pid,
            source: std::io::Error::other("the OS refused to terminate the process"),
        }),
    }
}
