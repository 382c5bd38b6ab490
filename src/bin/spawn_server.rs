//! Child process behind the resource limiter
//!
//! Invoked as `kolosal-spawn-server <config> <input> <output> <error>`; runs
//! the named task and writes its outcome back through the mailbox files.

use kolosal_runner::limiter::diagnostics::register_diagnostics;
use kolosal_runner::limiter::server::{install_panic_hook, serve, ServerPaths};
use kolosal_runner::limiter::TaskRegistry;
use kolosal_runner::runner::TrainCandidateTask;

fn main() -> anyhow::Result<()> {
    install_panic_hook();

    let paths = ServerPaths::from_args(std::env::args_os().skip(1))?;
    let mut registry = TaskRegistry::new();
    registry.register(TrainCandidateTask);
    register_diagnostics(&mut registry);

    serve(&paths, &registry)?;
    Ok(())
}
