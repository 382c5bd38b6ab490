//! Child side of the mailbox protocol
//!
//! The `kolosal-spawn-server` binary installs [`install_panic_hook`] and
//! calls [`serve`] with the four mailbox paths. The child applies the logging
//! config, runs the named task under `catch_unwind` and always writes both
//! `output` and `error` before exiting with code 0. Failures it cannot write
//! back surface as a non-zero exit.

use std::any::Any;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

use parking_lot::{const_mutex, Mutex};
use tracing::{error, info};

use super::mailbox::{read_bincode, write_bincode, ErrorEnvelope, InputEnvelope};
use super::task::TaskRegistry;
use super::traceback::TracebackSurrogate;
use crate::error::{Result, RunnerError};
use crate::logging::{init_child_logging, ExecutionContext};

/// Traceback recorded by the panic hook for the most recent panic
static LAST_PANIC: Mutex<Option<TracebackSurrogate>> = const_mutex(None);

/// The four mailbox files handed to the child on its command line
#[derive(Debug, Clone, PartialEq)]
pub struct ServerPaths {
    pub config: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub error: PathBuf,
}

impl ServerPaths {
    /// Parse `<config> <input> <output> <error>` (program name excluded)
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<PathBuf>,
    {
        let mut paths: Vec<PathBuf> = args.into_iter().map(Into::into).collect();
        if paths.len() != 4 {
            return Err(RunnerError::invalid_option(
                "argv",
                paths.len(),
                "expected <config> <input> <output> <error>",
            ));
        }
        let error = paths.remove(3);
        let output = paths.remove(2);
        let input = paths.remove(1);
        let config = paths.remove(0);
        Ok(Self {
            config,
            input,
            output,
            error,
        })
    }
}

/// Text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

/// Record a traceback surrogate for every panic; called once at startup
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let surrogate = TracebackSurrogate::capture(info.to_string());
        error!(panic = %info, "Task panicked");
        *LAST_PANIC.lock() = Some(surrogate);
    }));
}

/// Run the named task, folding every failure into the error slot
pub fn run_task(registry: &TaskRegistry, task_name: &str, payload: &[u8]) -> (Option<Vec<u8>>, ErrorEnvelope) {
    match catch_unwind(AssertUnwindSafe(|| registry.call(task_name, payload))) {
        Ok(Ok((value, None))) => (value, None),
        Ok(Ok((value, Some(e)))) => {
            let tb = (!e.is_classified()).then(|| TracebackSurrogate::capture(e.to_string()));
            (value, Some((e, tb)))
        }
        Ok(Err(e)) => (None, Some((e, None))),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let tb = LAST_PANIC
                .lock()
                .take()
                .unwrap_or_else(|| TracebackSurrogate::new(message.clone(), Vec::new()));
            (None, Some((RunnerError::Panic(message), Some(tb))))
        }
    }
}

/// Child entry point
pub fn serve(paths: &ServerPaths, registry: &TaskRegistry) -> Result<()> {
    let context = ExecutionContext::from_json(&fs::read_to_string(&paths.config)?)?;
    init_child_logging(&context);

    let (task_name, payload): InputEnvelope = read_bincode(&paths.input)?;
    info!(task = %task_name, pid = std::process::id(), "Spawn server running task");

    let (value, error) = run_task(registry, &task_name, &payload);
    write_bincode(&paths.output, &value)?;
    write_bincode(&paths.error, &error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::diagnostics::register_diagnostics;

    #[test]
    fn test_from_args_order() {
        let paths = ServerPaths::from_args(["c", "i", "o", "e"]).unwrap();
        assert_eq!(paths.config, PathBuf::from("c"));
        assert_eq!(paths.error, PathBuf::from("e"));
        assert!(ServerPaths::from_args(["c", "i"]).is_err());
    }

    #[test]
    fn test_run_task_unknown_name() {
        let registry = TaskRegistry::new();
        let (value, error) = run_task(&registry, "missing", &[]);
        assert!(value.is_none());
        assert!(matches!(error, Some((RunnerError::PipelineError { .. }, None))));
    }

    #[test]
    fn test_serve_writes_both_files() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = ServerPaths::from_args(["config", "input", "output", "error"].map(|f| tmp.path().join(f))).unwrap();
        fs::write(&paths.config, ExecutionContext::default().to_json().unwrap()).unwrap();
        let envelope: InputEnvelope = ("echo".to_string(), bincode::serialize(&"ping".to_string()).unwrap());
        write_bincode(&paths.input, &envelope).unwrap();

        let mut registry = TaskRegistry::new();
        register_diagnostics(&mut registry);
        serve(&paths, &registry).unwrap();

        let value: Option<Vec<u8>> = read_bincode(&paths.output).unwrap();
        let text: String = bincode::deserialize(&value.unwrap()).unwrap();
        assert_eq!(text, "ping");
        let error: ErrorEnvelope = read_bincode(&paths.error).unwrap();
        assert!(error.is_none());
    }
}
