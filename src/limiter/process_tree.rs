//! Killing a child together with everything it spawned

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

/// `root` followed by its descendants in breadth-first order
pub fn descendants(root: u32, table: &[(u32, u32)]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, ppid) in table {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }
    let mut order = vec![root];
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if !order.contains(&kid) {
                    order.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    order
}

/// `(pid, parent pid)` for every live process
#[cfg(unix)]
fn process_table() -> Vec<(u32, u32)> {
    let mut system = sysinfo::System::new();
    system.refresh_processes();
    system
        .processes()
        .iter()
        .filter_map(|(pid, process)| process.parent().map(|ppid| (pid.as_u32(), ppid.as_u32())))
        .collect()
}

/// SIGKILL `root` and all of its descendants, root first
///
/// Processes that are already gone are skipped silently. The child is started
/// as the leader of its own process group, so the group is killed as well to
/// catch anything reparented before the table was read.
#[cfg(unix)]
pub fn kill_tree(root: u32) {
    let table = process_table();
    let victims = descendants(root, &table);
    debug!(root, count = victims.len(), "Killing process tree");
    for pid in victims {
        signal_kill(pid as libc::pid_t);
    }
    signal_kill(-(root as libc::pid_t));
}

#[cfg(unix)]
fn signal_kill(target: libc::pid_t) {
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(target, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid = target, error = %err, "Failed to kill process");
        }
    }
}

#[cfg(windows)]
pub fn kill_tree(root: u32) {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &root.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    match status {
        Ok(s) if s.success() => debug!(root, "Killed process tree"),
        Ok(s) => debug!(root, code = ?s.code(), "taskkill reported failure, process likely gone"),
        Err(e) => warn!(root, error = %e, "Failed to run taskkill"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breadth_first_from_root() {
        let table = [(2, 1), (3, 1), (4, 2), (5, 4), (9, 8)];
        assert_eq!(descendants(1, &table), vec![1, 2, 3, 4, 5]);
        assert_eq!(descendants(4, &table), vec![4, 5]);
    }

    #[test]
    fn test_cycles_do_not_loop() {
        let table = [(2, 1), (1, 2), (3, 3)];
        assert_eq!(descendants(1, &table), vec![1, 2]);
        assert_eq!(descendants(3, &table), vec![3]);
    }
}
