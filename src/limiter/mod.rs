//! Resource-limited execution of tasks in a spawned child process
//!
//! [`ResourceLimiter::execute`] writes the task input to a [`Mailbox`],
//! starts `kolosal-spawn-server` under the configured caps, waits up to the
//! wall-clock deadline and reads back the value and error the child left
//! behind. Abnormal exits are classified into [`RunnerError`] variants.
//! When limiting is disabled the task runs in-process with the same
//! contract.

pub mod diagnostics;
pub mod exit_status;
pub mod mailbox;
pub mod oom;
pub mod process_tree;
pub mod server;
pub mod task;
pub mod traceback;

pub use exit_status::ChildExit;
pub use mailbox::Mailbox;
pub use task::{RemoteTask, TaskRegistry, TaskReturn};
pub use traceback::TracebackSurrogate;

use std::fs::{File, OpenOptions};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{CHILD_LOG_FILE_ENV, SPAWN_SERVER_BIN, SPAWN_SERVER_ENV};
use crate::error::{ConfigErrorKind, Result, RunnerError};
use crate::logging::ExecutionContext;


/// Caps applied to one execution; `None` means unbounded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceCaps {
    pub mem_in_mb: Option<u64>,
    pub cpu_time_in_s: Option<f64>,
    pub wall_time_in_s: Option<f64>,
    pub total_wall_time_in_s: Option<f64>,
    pub num_processes: Option<u64>,
    pub grace_period_in_s: Option<f64>,
}

impl ResourceCaps {
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.mem_in_mb = Some(mb);
        self
    }

    pub fn with_cpu_time(mut self, seconds: f64) -> Self {
        self.cpu_time_in_s = Some(seconds);
        self
    }

    pub fn with_wall_time(mut self, seconds: f64) -> Self {
        self.wall_time_in_s = Some(seconds);
        self
    }

    pub fn with_total_wall_time(mut self, seconds: f64) -> Self {
        self.total_wall_time_in_s = Some(seconds);
        self
    }

    pub fn with_num_processes(mut self, n: u64) -> Self {
        self.num_processes = Some(n);
        self
    }

    pub fn with_grace_period(mut self, seconds: f64) -> Self {
        self.grace_period_in_s = Some(seconds);
        self
    }

    /// Overwrite every cap that `partial` sets
    pub fn merge_from(&mut self, partial: &ResourceCaps) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if partial.$field.is_some() {
                    self.$field = partial.$field;
                })*
            };
        }
        take!(mem_in_mb, cpu_time_in_s, wall_time_in_s, total_wall_time_in_s, num_processes, grace_period_in_s);
    }

    /// `min(wall, total_wall)` over the caps that are set
    pub fn effective_wall_time(&self) -> Option<f64> {
        match (self.wall_time_in_s, self.total_wall_time_in_s) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Instant after which the parent kills the child: wall plus grace
    pub fn kill_after(&self) -> Option<Duration> {
        self.effective_wall_time().map(|wall| {
            let total = wall.max(0.0) + self.grace_period_in_s.unwrap_or(0.0).max(0.0);
            Duration::from_secs_f64(total)
        })
    }

    pub fn is_unbounded(&self) -> bool {
        self.mem_in_mb.is_none()
            && self.cpu_time_in_s.is_none()
            && self.effective_wall_time().is_none()
            && self.num_processes.is_none()
    }
}

/// How the limiter runs tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// When false, tasks run in-process and caps are ignored
    pub enabled: bool,
    /// Explicit spawn server location
    pub server_path: Option<PathBuf>,
    pub poll_interval_ms: u64,
    /// Child log file; defaults to a file inside the run's mailbox, which is
    /// replayed at debug level and removed with it
    pub child_log_file: Option<PathBuf>,
    pub context: ExecutionContext,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            server_path: None,
            poll_interval_ms: 10,
            child_log_file: None,
            context: ExecutionContext::default(),
        }
    }
}

impl LimiterSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_path = Some(path.into());
        self
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_child_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.child_log_file = Some(path.into());
        self
    }

    /// Spawn server location: explicit path, then `KOLOSAL_SPAWN_SERVER`,
    /// then next to the current executable or one directory up
    pub fn resolve_server_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.server_path {
            return Ok(path.clone());
        }
        if let Some(path) = std::env::var_os(SPAWN_SERVER_ENV) {
            return Ok(PathBuf::from(path));
        }
        let file_name = format!("{}{}", SPAWN_SERVER_BIN, std::env::consts::EXE_SUFFIX);
        let exe = std::env::current_exe()?;
        let found = exe.parent()
            .into_iter()
            .flat_map(|dir| [Some(dir), dir.parent()])
            .flatten()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                RunnerError::ConfigError(ConfigErrorKind::Other(format!(
                    "cannot locate {}; set {} to its path",
                    file_name, SPAWN_SERVER_ENV
                )))
            });
        found
    }
}

/// Result of one limited execution
#[derive(Debug)]
pub struct ExecuteOutcome<T> {
    pub value: Option<T>,
    pub error: Option<RunnerError>,
    /// Measured in the parent, whatever the outcome
    pub wall_time_s: f64,
}

/// Runs [`RemoteTask`]s under [`ResourceCaps`]
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    caps: ResourceCaps,
    settings: LimiterSettings,
}

impl ResourceLimiter {
    pub fn new(caps: ResourceCaps, settings: LimiterSettings) -> Self {
        Self { caps, settings }
    }

    /// Limiter that runs everything in-process
    pub fn in_process() -> Self {
        Self::new(ResourceCaps::default(), LimiterSettings::disabled())
    }

    pub fn caps(&self) -> &ResourceCaps {
        &self.caps
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    /// Run `task` on `input`, isolated in a child process when enabled
    pub fn execute<T: RemoteTask>(&self, working_dir: &Path, task: &T, input: T::Input) -> ExecuteOutcome<T::Output> {
        let start = Instant::now();
        let (value, raw_error) = if self.settings.enabled {
            match self.run_in_child(working_dir, task, &input, start) {
                Ok(pair) => pair,
                Err(e) => (None, Some((e, None))),
            }
        } else {
            run_in_process(task, input)
        };
        let error = raw_error.map(|(e, tb)| settle_error(task.name(), e, tb));
        ExecuteOutcome {
            value,
            error,
            wall_time_s: start.elapsed().as_secs_f64(),
        }
    }

    #[allow(clippy::type_complexity)]
    fn run_in_child<T: RemoteTask>(
        &self,
        working_dir: &Path,
        task: &T,
        input: &T::Input,
        start: Instant,
    ) -> Result<(Option<T::Output>, mailbox::ErrorEnvelope)> {
        let mailbox = Mailbox::create(working_dir)?;
        mailbox.write_config(&self.settings.context)?;
        mailbox.write_input(task.name(), input)?;

        let mut child = self.spawn(&mailbox)?;
        let pid = child.id();
        info!(task = task.name(), pid, caps = ?self.caps, "Started training subprocess");

        if let Some(timed_out) = self.wait_or_kill(&mut child)? {
            warn!(task = task.name(), pid, wall_time_s = timed_out, "Subprocess exceeded its wall time, killed");
            return Ok((
                None,
                Some((
                    RunnerError::IterationTimeout {
                        wall_time_s: start.elapsed().as_secs_f64(),
                    },
                    None,
                )),
            ));
        }
        let status = child.wait()?;
        self.replay_child_log(&mailbox, pid);
        let exit = ChildExit::from_status(&status);
        debug!(pid, return_code = exit.return_code(), "Subprocess exited");

        let stderr = mailbox.stderr_text();
        if let Some(err) = exit_status::classify(exit, pid, &stderr, self.caps.cpu_time_in_s, oom::lookup) {
            return Ok((None, Some((err, None))));
        }
        let value = mailbox.read_output::<T::Output>()?;
        let error = mailbox.read_error()?;
        Ok((value, error))
    }

    fn replay_child_log(&self, mailbox: &Mailbox, pid: u32) {
        if self.settings.child_log_file.is_some() {
            return;
        }
        for line in mailbox.child_log_lines() {
            debug!(pid, "child: {}", line);
        }
    }

    fn spawn(&self, mailbox: &Mailbox) -> Result<Child> {
        let server = self.settings.resolve_server_path()?;
        let log_file = self
            .settings
            .child_log_file
            .clone()
            .unwrap_or_else(|| mailbox.path(mailbox::CHILD_LOG_FILE));

        let mut cmd = Command::new(&server);
        cmd.arg(mailbox.path(mailbox::CONFIG_FILE))
            .arg(mailbox.path(mailbox::INPUT_FILE))
            .arg(mailbox.path(mailbox::OUTPUT_FILE))
            .arg(mailbox.path(mailbox::ERROR_FILE))
            .env(CHILD_LOG_FILE_ENV, &log_file)
            .stdin(Stdio::null())
            .stdout(create_capture(&mailbox.path(mailbox::STDOUT_FILE))?)
            .stderr(create_capture(&mailbox.path(mailbox::STDERR_FILE))?);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(0);
            let caps = self.caps.clone();
            // SAFETY: apply_rlimits only calls setrlimit, which is async-signal-safe
            unsafe {
                cmd.pre_exec(move || apply_rlimits(&caps));
            }
        }

        cmd.spawn().map_err(|e| RunnerError::SubprocessError {
            return_code: -1,
            stderr: format!("failed to start {}: {}", server.display(), e),
        })
    }

    /// Poll until exit or deadline; on deadline kill the tree and return the
    /// elapsed seconds
    fn wait_or_kill(&self, child: &mut Child) -> Result<Option<f64>> {
        let start = Instant::now();
        let deadline = self.caps.kill_after().and_then(|d| start.checked_add(d));
        let poll = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        loop {
            if child.try_wait()?.is_some() {
                return Ok(None);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                process_tree::kill_tree(child.id());
                let _ = child.kill();
                let _ = child.wait();
                return Ok(Some(start.elapsed().as_secs_f64()));
            }
            std::thread::sleep(poll);
        }
    }
}

fn create_capture(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).write(true).truncate(true).open(path)?)
}

#[cfg(unix)]
fn apply_rlimits(caps: &ResourceCaps) -> std::io::Result<()> {
    fn set(resource: libc::c_int, soft: u64, hard: u64) -> std::io::Result<()> {
        let limit = libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        };
        // SAFETY: plain syscall on a stack value
        if unsafe { libc::setrlimit(resource as _, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    if let Some(mb) = caps.mem_in_mb {
        let bytes = mb.saturating_mul(1024 * 1024);
        set(libc::RLIMIT_AS as libc::c_int, bytes, bytes)?;
    }
    if let Some(cpu) = caps.cpu_time_in_s {
        let soft = cpu.ceil().max(1.0) as u64;
        set(libc::RLIMIT_CPU as libc::c_int, soft, soft + 1)?;
    }
    if let Some(n) = caps.num_processes {
        set(libc::RLIMIT_NPROC as libc::c_int, n, n)?;
    }
    Ok(())
}

fn run_in_process<T: RemoteTask>(task: &T, input: T::Input) -> (Option<T::Output>, mailbox::ErrorEnvelope) {
    match catch_unwind(AssertUnwindSafe(|| task.call(input))) {
        Ok((value, error)) => (value, error.map(|e| (e, None))),
        Err(payload) => {
            let message = server::panic_message(payload.as_ref());
            let tb = TracebackSurrogate::capture(message.clone());
            (None, Some((RunnerError::Panic(message), Some(tb))))
        }
    }
}

/// Log the child traceback and wrap unclassified errors
fn settle_error(task: &str, error: RunnerError, traceback: Option<TracebackSurrogate>) -> RunnerError {
    if let Some(tb) = &traceback {
        warn!(task, error = %error, traceback = %tb.render(), "Task failed");
    } else {
        warn!(task, error = %error, "Task failed");
    }
    match error {
        RunnerError::PipelineError { message, traceback: None } if traceback.is_some() => {
            RunnerError::PipelineError { message, traceback }
        }
        e if e.is_classified() => e,
        other => RunnerError::PipelineError {
            message: other.to_string(),
            traceback,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::diagnostics::{EchoTask, PanicTask, RaiseTask, RaiseInput};

    #[test]
    fn test_merge_and_effective_wall() {
        let mut caps = ResourceCaps::default().with_wall_time(30.0).with_memory_mb(256);
        caps.merge_from(&ResourceCaps::default().with_total_wall_time(12.0).with_grace_period(2.0));
        assert_eq!(caps.mem_in_mb, Some(256));
        assert_eq!(caps.effective_wall_time(), Some(12.0));
        assert_eq!(caps.kill_after(), Some(Duration::from_secs(14)));
        assert!(ResourceCaps::default().is_unbounded());
    }

    #[test]
    fn test_in_process_echo() {
        let tmp = tempfile::tempdir().unwrap();
        let out = ResourceLimiter::in_process().execute(tmp.path(), &EchoTask, "hi".to_string());
        assert_eq!(out.value.as_deref(), Some("hi"));
        assert!(out.error.is_none());
        assert!(out.wall_time_s >= 0.0);
    }

    #[test]
    fn test_in_process_panic_becomes_pipeline_error() {
        let tmp = tempfile::tempdir().unwrap();
        let out = ResourceLimiter::in_process().execute(tmp.path(), &PanicTask, "kaboom".to_string());
        assert!(out.value.is_none());
        match out.error {
            Some(RunnerError::PipelineError { message, traceback }) => {
                assert!(message.contains("kaboom"));
                assert!(traceback.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inner_errors_keep_or_wrap() {
        let tmp = tempfile::tempdir().unwrap();
        let limiter = ResourceLimiter::in_process();
        let classified = limiter.execute(
            tmp.path(),
            &RaiseTask,
            RaiseInput {
                classified: true,
                message: "bad fit".into(),
            },
        );
        assert!(matches!(classified.error, Some(RunnerError::FitError { .. })));

        let other = limiter.execute(
            tmp.path(),
            &RaiseTask,
            RaiseInput {
                classified: false,
                message: "odd".into(),
            },
        );
        assert!(matches!(other.error, Some(RunnerError::PipelineError { .. })));
    }

    #[test]
    fn test_missing_server_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = LimiterSettings::default().with_server_path(tmp.path().join("does-not-exist"));
        let limiter = ResourceLimiter::new(ResourceCaps::default(), settings);
        let out = limiter.execute(tmp.path(), &EchoTask, "x".to_string());
        assert!(out.value.is_none());
        assert!(matches!(out.error, Some(RunnerError::SubprocessError { .. })));
        let leftovers = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(mailbox::DIR_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }
}
