//! Translation of child exit statuses into runner errors

use std::process::ExitStatus;

use super::oom::OomRecord;
use crate::constants::WINDOWS_CPU_TIMEOUT_CODE;
use crate::error::RunnerError;

#[cfg(unix)]
mod signals {
    pub const SIGABRT: i32 = libc::SIGABRT;
    pub const SIGKILL: i32 = libc::SIGKILL;
    pub const SIGXCPU: i32 = libc::SIGXCPU;
}

#[cfg(not(unix))]
mod signals {
    pub const SIGABRT: i32 = 6;
    pub const SIGKILL: i32 = 9;
    pub const SIGXCPU: i32 = 24;
}

pub use signals::{SIGABRT, SIGKILL, SIGXCPU};

/// Marker the Rust runtime prints before aborting on allocation failure
const ALLOC_FAILURE_MARKER: &str = "memory allocation of";

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    Signal(i32),
}

impl ChildExit {
    pub fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt as _;
            if let Some(sig) = status.signal() {
                return ChildExit::Signal(sig);
            }
        }
        ChildExit::Code(status.code().unwrap_or(1))
    }

    /// Return code in the signed convention: negative for signals
    pub fn return_code(self) -> i32 {
        match self {
            ChildExit::Code(c) => c,
            ChildExit::Signal(s) => -s,
        }
    }
}

/// Classify an abnormal exit; `None` means the child exited cleanly and the
/// mailbox should be read
///
/// `oom_lookup` is consulted only for signal deaths on Linux.
pub fn classify(
    exit: ChildExit,
    pid: u32,
    stderr: &str,
    cpu_time_s: Option<f64>,
    oom_lookup: impl FnOnce(u32) -> Option<OomRecord>,
) -> Option<RunnerError> {
    match exit {
        ChildExit::Code(0) => None,
        ChildExit::Code(code) if code as u32 == WINDOWS_CPU_TIMEOUT_CODE => Some(RunnerError::CpuTimeout { cpu_time_s }),
        ChildExit::Code(code) => Some(RunnerError::SubprocessError {
            return_code: code,
            stderr: stderr.trim().to_string(),
        }),
        ChildExit::Signal(SIGXCPU) => Some(RunnerError::CpuTimeout { cpu_time_s }),
        ChildExit::Signal(signal) => {
            if signal == SIGABRT {
                if let Some(line) = stderr.lines().find(|l| l.contains(ALLOC_FAILURE_MARKER)) {
                    return Some(RunnerError::InsufficientMemory {
                        pid: Some(pid),
                        anon_rss_kb: None,
                        detail: line.trim().to_string(),
                    });
                }
            }
            if cfg!(target_os = "linux") {
                if let Some(rec) = oom_lookup(pid) {
                    return Some(RunnerError::InsufficientMemory {
                        pid: Some(rec.pid),
                        anon_rss_kb: rec.anon_rss_kb,
                        detail: rec.line,
                    });
                }
                if signal == SIGKILL || signal == SIGABRT {
                    return Some(RunnerError::InsufficientMemoryLikely { pid, signal });
                }
            }
            Some(RunnerError::PipelineError {
                message: format!("training subprocess {} terminated by signal {}", pid, signal),
                traceback: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_oom(_: u32) -> Option<OomRecord> {
        None
    }

    #[test]
    fn test_clean_exit() {
        assert!(classify(ChildExit::Code(0), 1, "", None, no_oom).is_none());
    }

    #[test]
    fn test_positive_code_carries_stderr() {
        let err = classify(ChildExit::Code(3), 1, "bad things\n", None, no_oom).unwrap();
        assert!(matches!(err, RunnerError::SubprocessError { return_code: 3, ref stderr } if stderr == "bad things"));
    }

    #[test]
    fn test_cpu_timeouts() {
        let err = classify(ChildExit::Signal(SIGXCPU), 1, "", Some(2.0), no_oom).unwrap();
        assert!(matches!(err, RunnerError::CpuTimeout { cpu_time_s: Some(_) }));
        let err = classify(ChildExit::Code(WINDOWS_CPU_TIMEOUT_CODE as i32), 1, "", None, no_oom).unwrap();
        assert!(matches!(err, RunnerError::CpuTimeout { .. }));
    }

    #[test]
    fn test_allocation_abort_is_memory() {
        let stderr = "memory allocation of 1099511627776 bytes failed\n";
        let err = classify(ChildExit::Signal(SIGABRT), 9, stderr, None, no_oom).unwrap();
        assert!(matches!(err, RunnerError::InsufficientMemory { pid: Some(9), .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_kill_with_and_without_oom_record() {
        let err = classify(ChildExit::Signal(SIGKILL), 5, "", None, |pid| {
            Some(OomRecord {
                pid,
                anon_rss_kb: Some(1024),
                line: "Killed process 5".into(),
            })
        })
        .unwrap();
        assert!(matches!(err, RunnerError::InsufficientMemory { anon_rss_kb: Some(1024), .. }));

        let err = classify(ChildExit::Signal(SIGKILL), 5, "", None, no_oom).unwrap();
        assert!(matches!(err, RunnerError::InsufficientMemoryLikely { pid: 5, signal } if signal == SIGKILL));
    }

    #[test]
    fn test_return_code_sign() {
        assert_eq!(ChildExit::Signal(9).return_code(), -9);
        assert_eq!(ChildExit::Code(2).return_code(), 2);
    }
}
