//! Integration test: resource-limited execution through the spawn server

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kolosal_runner::limiter::diagnostics::{
    AllocateTask, BurnCpuTask, EchoTask, PanicTask, RaiseInput, RaiseTask, SignalSelfTask, SleepTask, SpawnAndHangInput,
    SpawnAndHangTask,
};
use kolosal_runner::limiter::{LimiterSettings, RemoteTask, ResourceCaps, ResourceLimiter, TaskReturn};
use kolosal_runner::RunnerError;

fn server_settings() -> LimiterSettings {
    LimiterSettings::default().with_server_path(env!("CARGO_BIN_EXE_kolosal-spawn-server"))
}

fn limiter(caps: ResourceCaps) -> ResourceLimiter {
    ResourceLimiter::new(caps, server_settings())
}

fn mailbox_dirs(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .count()
}

#[cfg(unix)]
fn alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[test]
fn test_echo_round_trips_through_child() {
    let tmp = tempfile::tempdir().unwrap();
    let out = limiter(ResourceCaps::default().with_wall_time(30.0)).execute(tmp.path(), &EchoTask, "ping".to_string());
    assert!(out.error.is_none(), "echo failed: {:?}", out.error);
    assert_eq!(out.value.as_deref(), Some("ping"));
    assert_eq!(mailbox_dirs(tmp.path()), 0, "mailbox directory left behind");
}

#[test]
fn test_child_leaves_nothing_in_working_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let limiter = limiter(ResourceCaps::default().with_wall_time(30.0));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let limiter = limiter.clone();
            let dir = tmp.path().to_path_buf();
            std::thread::spawn(move || limiter.execute(&dir, &EchoTask, format!("run-{}", i)))
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let out = handle.join().unwrap();
        assert_eq!(out.value, Some(format!("run-{}", i)));
    }
    let leftovers: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().filter_map(|e| e.ok()).map(|e| e.file_name()).collect();
    assert!(leftovers.is_empty(), "files left in working dir: {:?}", leftovers);
}

#[test]
fn test_wall_time_kills_sleeping_child() {
    let tmp = tempfile::tempdir().unwrap();
    let caps = ResourceCaps::default().with_wall_time(1.0).with_grace_period(0.0);
    let start = Instant::now();
    let out = limiter(caps).execute(tmp.path(), &SleepTask, 5.0);
    let elapsed = start.elapsed().as_secs_f64();

    assert!(out.value.is_none());
    match out.error {
        Some(RunnerError::IterationTimeout { wall_time_s }) => {
            assert!(wall_time_s >= 0.9 && wall_time_s < 4.0, "unexpected wall time {}", wall_time_s);
        }
        other => panic!("expected a wall-time timeout, got {:?}", other),
    }
    assert!(elapsed < 4.5, "limiter waited {}s for a 1s cap", elapsed);
}

#[cfg(unix)]
#[test]
fn test_timeout_kills_whole_process_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let pid_file = tmp.path().join("pids.txt");
    let caps = ResourceCaps::default().with_wall_time(1.5).with_grace_period(0.0);
    let out = limiter(caps).execute(
        tmp.path(),
        &SpawnAndHangTask,
        SpawnAndHangInput {
            pid_file: pid_file.clone(),
            children: 2,
        },
    );
    assert!(matches!(out.error, Some(RunnerError::IterationTimeout { .. })), "got {:?}", out.error);

    let pids: Vec<u32> = std::fs::read_to_string(&pid_file)
        .expect("child never wrote its pids")
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    assert_eq!(pids.len(), 3, "expected server pid plus two sleepers: {:?}", pids);

    // Orphans are reaped by init asynchronously
    let deadline = Instant::now() + Duration::from_secs(5);
    while pids.iter().any(|&p| alive(p)) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    let survivors: Vec<u32> = pids.iter().copied().filter(|&p| alive(p)).collect();
    assert!(survivors.is_empty(), "processes survived the kill: {:?}", survivors);
}

#[test]
fn test_child_panic_becomes_pipeline_error() {
    let tmp = tempfile::tempdir().unwrap();
    let out = limiter(ResourceCaps::default().with_wall_time(30.0)).execute(tmp.path(), &PanicTask, "exploded".to_string());
    assert!(out.value.is_none());
    match out.error {
        Some(RunnerError::PipelineError { message, traceback }) => {
            assert!(message.contains("exploded"), "message lost: {}", message);
            let tb = traceback.expect("panic should carry a traceback");
            assert!(tb.render().contains("exploded"));
        }
        other => panic!("expected a pipeline error, got {:?}", other),
    }
}

#[test]
fn test_child_errors_keep_their_class() {
    let tmp = tempfile::tempdir().unwrap();
    let limiter = limiter(ResourceCaps::default().with_wall_time(30.0));

    let classified = limiter.execute(
        tmp.path(),
        &RaiseTask,
        RaiseInput {
            classified: true,
            message: "singular matrix".into(),
        },
    );
    match classified.error {
        Some(RunnerError::FitError { message, .. }) => assert_eq!(message, "singular matrix"),
        other => panic!("expected a fit error, got {:?}", other),
    }

    let unclassified = limiter.execute(
        tmp.path(),
        &RaiseTask,
        RaiseInput {
            classified: false,
            message: "strange".into(),
        },
    );
    assert!(
        matches!(unclassified.error, Some(RunnerError::PipelineError { .. })),
        "got {:?}",
        unclassified.error
    );
}

#[cfg(target_os = "linux")]
#[test]
fn test_sigkill_is_reported_as_memory_pressure() {
    let tmp = tempfile::tempdir().unwrap();
    let out = limiter(ResourceCaps::default().with_wall_time(30.0)).execute(tmp.path(), &SignalSelfTask, libc::SIGKILL);
    assert!(
        matches!(
            out.error,
            Some(RunnerError::InsufficientMemoryLikely { .. }) | Some(RunnerError::InsufficientMemory { .. })
        ),
        "got {:?}",
        out.error
    );
}

#[cfg(target_os = "linux")]
#[test]
fn test_allocation_failure_is_insufficient_memory() {
    let tmp = tempfile::tempdir().unwrap();
    let caps = ResourceCaps::default().with_memory_mb(256).with_wall_time(30.0);
    let out = limiter(caps).execute(tmp.path(), &AllocateTask, 4096);
    assert!(out.value.is_none());
    assert!(
        matches!(out.error, Some(RunnerError::InsufficientMemory { .. })),
        "got {:?}",
        out.error
    );
}

#[cfg(unix)]
#[test]
fn test_cpu_cap_is_enforced() {
    let tmp = tempfile::tempdir().unwrap();
    let caps = ResourceCaps::default().with_cpu_time(1.0).with_wall_time(20.0);
    let out = limiter(caps).execute(tmp.path(), &BurnCpuTask, 10.0);
    assert!(out.value.is_none());
    match out.error {
        Some(RunnerError::CpuTimeout { cpu_time_s }) => assert_eq!(cpu_time_s, Some(1.0)),
        other => panic!("expected a CPU timeout, got {:?}", other),
    }
}

static SEEN_PIDS: Mutex<Vec<u32>> = Mutex::new(Vec::new());

/// Records the pid it runs in
struct WhereAmI;

impl RemoteTask for WhereAmI {
    type Input = u32;
    type Output = u32;

    fn name(&self) -> &'static str {
        "where-am-i"
    }

    fn call(&self, tag: u32) -> TaskReturn<u32> {
        SEEN_PIDS.lock().unwrap().push(std::process::id());
        (Some(tag), None)
    }
}

#[test]
fn test_disabled_limiter_runs_in_process() {
    let tmp = tempfile::tempdir().unwrap();
    // Caps are ignored entirely once limiting is off
    let caps = ResourceCaps::default().with_wall_time(0.001).with_memory_mb(1);
    let limiter = ResourceLimiter::new(caps, LimiterSettings::disabled());
    let out = limiter.execute(tmp.path(), &WhereAmI, 7);

    assert!(out.error.is_none(), "got {:?}", out.error);
    assert_eq!(out.value, Some(7));
    assert_eq!(SEEN_PIDS.lock().unwrap().as_slice(), &[std::process::id()]);
    assert_eq!(mailbox_dirs(tmp.path()), 0);
}
