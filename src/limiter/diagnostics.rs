//! Small tasks that exercise the limiter end to end
//!
//! Registered in the spawn server next to the runner tasks; used by the
//! `selftest` command and the limiter integration tests.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::task::{RemoteTask, TaskRegistry, TaskReturn};
use crate::error::RunnerError;

const MB: usize = 1024 * 1024;

/// Returns its input
pub struct EchoTask;

impl RemoteTask for EchoTask {
    type Input = String;
    type Output = String;

    fn name(&self) -> &'static str {
        "echo"
    }

    fn call(&self, input: String) -> TaskReturn<String> {
        (Some(input), None)
    }
}

/// Sleeps for the given number of seconds
pub struct SleepTask;

impl RemoteTask for SleepTask {
    type Input = f64;
    type Output = f64;

    fn name(&self) -> &'static str {
        "sleep"
    }

    fn call(&self, seconds: f64) -> TaskReturn<f64> {
        std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
        (Some(seconds), None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnAndHangInput {
    /// Receives the task's own pid followed by the pids it started, one per line
    pub pid_file: PathBuf,
    pub children: usize,
}

/// Starts long-lived subprocesses, records their pids and never returns
pub struct SpawnAndHangTask;

impl RemoteTask for SpawnAndHangTask {
    type Input = SpawnAndHangInput;
    type Output = ();

    fn name(&self) -> &'static str {
        "spawn-and-hang"
    }

    fn call(&self, input: SpawnAndHangInput) -> TaskReturn<()> {
        let mut pids = vec![std::process::id()];
        for _ in 0..input.children {
            match long_sleeper().spawn() {
                Ok(child) => pids.push(child.id()),
                Err(e) => return (None, Some(e.into())),
            }
        }
        let text: String = pids.iter().map(|p| format!("{}\n", p)).collect();
        if let Err(e) = std::fs::write(&input.pid_file, text) {
            return (None, Some(e.into()));
        }
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }
}

#[cfg(unix)]
fn long_sleeper() -> Command {
    let mut cmd = Command::new("sleep");
    cmd.arg("3600").stdout(Stdio::null()).stderr(Stdio::null());
    cmd
}

#[cfg(windows)]
fn long_sleeper() -> Command {
    let mut cmd = Command::new("ping");
    cmd.args(["-n", "3600", "127.0.0.1"]).stdout(Stdio::null()).stderr(Stdio::null());
    cmd
}

/// Allocates and touches the given number of megabytes
pub struct AllocateTask;

impl RemoteTask for AllocateTask {
    type Input = usize;
    type Output = usize;

    fn name(&self) -> &'static str {
        "allocate"
    }

    fn call(&self, megabytes: usize) -> TaskReturn<usize> {
        let mut block: Vec<u8> = vec![0; megabytes.saturating_mul(MB)];
        for i in (0..block.len()).step_by(4096) {
            block[i] = 1;
        }
        let touched = block.iter().step_by(4096).filter(|&&b| b == 1).count();
        (Some(touched), None)
    }
}

/// Panics with its input as the message
pub struct PanicTask;

impl RemoteTask for PanicTask {
    type Input = String;
    type Output = ();

    fn name(&self) -> &'static str {
        "panic"
    }

    fn call(&self, message: String) -> TaskReturn<()> {
        panic!("{}", message)
    }
}

/// Delivers a signal to its own process
pub struct SignalSelfTask;

impl RemoteTask for SignalSelfTask {
    type Input = i32;
    type Output = ();

    fn name(&self) -> &'static str {
        "signal-self"
    }

    #[cfg(unix)]
    fn call(&self, signal: i32) -> TaskReturn<()> {
        // SAFETY: raise(3) has no memory-safety preconditions
        unsafe {
            libc::raise(signal);
        }
        (None, Some(RunnerError::ComputationError(format!("survived signal {}", signal))))
    }

    #[cfg(not(unix))]
    fn call(&self, signal: i32) -> TaskReturn<()> {
        (None, Some(RunnerError::ComputationError(format!("cannot raise signal {} on this platform", signal))))
    }
}

/// Spins the CPU for the given number of seconds
pub struct BurnCpuTask;

impl RemoteTask for BurnCpuTask {
    type Input = f64;
    type Output = u64;

    fn name(&self) -> &'static str {
        "burn-cpu"
    }

    fn call(&self, seconds: f64) -> TaskReturn<u64> {
        let start = Instant::now();
        let mut x: u64 = 0;
        while start.elapsed().as_secs_f64() < seconds {
            for i in 0..10_000u64 {
                x = std::hint::black_box(x.wrapping_mul(6364136223846793005).wrapping_add(i));
            }
        }
        (Some(x), None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaiseInput {
    /// Return a fit failure instead of an unclassified computation error
    pub classified: bool,
    pub message: String,
}

/// Reports an inner error without a value
pub struct RaiseTask;

impl RemoteTask for RaiseTask {
    type Input = RaiseInput;
    type Output = ();

    fn name(&self) -> &'static str {
        "raise"
    }

    fn call(&self, input: RaiseInput) -> TaskReturn<()> {
        let err = if input.classified {
            RunnerError::FitError {
                learner: "diagnostics".to_string(),
                message: input.message,
            }
        } else {
            RunnerError::ComputationError(input.message)
        };
        (None, Some(err))
    }
}

pub fn register_diagnostics(registry: &mut TaskRegistry) {
    registry
        .register(EchoTask)
        .register(SleepTask)
        .register(SpawnAndHangTask)
        .register(AllocateTask)
        .register(PanicTask)
        .register(SignalSelfTask)
        .register(BurnCpuTask)
        .register(RaiseTask);
}
