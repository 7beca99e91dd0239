use std::{
    os::unix::ffi::OsStrExt,
    path::PathBuf,
    sync::atomic::{AtomicPtr, Ordering},
};

use anyhow::Context;
use rerun_cpu::{ExecutionState, GlobalState, RuntimeConfig};
use rerun_rtld::FunctionStore;

use crate::{
    config::UserArgs,
    stack::{GuestStack, HostInfo},
};

mod config;
mod loader;
mod stack;

#[cfg(test)]
mod tests;

/// The runtime, kept reachable for the exit handler.
static GLOBAL: AtomicPtr<GlobalState> = AtomicPtr::new(std::ptr::null_mut());

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("RERUN_LOG"))
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        log_error_and_exit(e);
    }
}

fn run() -> anyhow::Result<()> {
    let dir: PathBuf = match std::env::args_os().nth(1) {
        Some(dir) => dir.into(),
        None => anyhow::bail!("Usage: rerunner <function-object-dir>"),
    };

    let config = RuntimeConfig::from_env()?;
    tracing::debug!("{config:?}");
    let user_args = UserArgs::read(&dir)?;

    let global = rerun_dispatch::new_runtime(&config, FunctionStore::new(dir))
        .context("failed to initialize runtime memory")?;
    let global: &'static mut GlobalState = Box::leak(global);

    let image = loader::load_file(&user_args.binary)?;
    tracing::debug!("loaded {}: {image:x?}", user_args.binary.display());

    let argv: Vec<&[u8]> = user_args.argv.iter().map(|arg| arg.as_bytes()).collect();
    let env: Vec<Vec<u8>> = std::env::vars_os()
        .map(|(key, value)| [key.as_bytes(), b"=", value.as_bytes()].concat())
        .collect();
    let envp: Vec<&[u8]> = env.iter().map(|var| var.as_slice()).collect();

    let mut stack = GuestStack::map(config.stack_size)?;
    let sp = stack::build_initial_stack(
        &mut stack.builder(),
        &argv,
        &envp,
        &image,
        &HostInfo::current(),
    )?;
    // The guest owns the stack from now on.
    std::mem::forget(stack);

    let state = global.new_execution_state().context("failed to allocate execution state")?;
    // Safety: `state` was just initialized by the runtime and is not aliased.
    unsafe {
        (*state).set_pc(image.entry);
        (*state).set_sp(sp);
        ExecutionState::install(state).context("failed to install execution state")?;
    }

    GLOBAL.store(global, Ordering::Release);
    if unsafe { libc::atexit(log_stats_at_exit) } != 0 {
        tracing::warn!("failed to register exit handler");
    }

    tracing::info!("starting guest at {:#x} (sp={sp:#x})", image.entry);
    let loop_func = global.dispatcher.loop_func;
    unsafe { loop_func((*state).regs_ptr()) }
}

extern "C" fn log_stats_at_exit() {
    let global = GLOBAL.load(Ordering::Acquire);
    if !global.is_null() {
        // Safety: the runtime is leaked so it remains valid until the process exits.
        unsafe { (*global).log_stats() };
    }
}

fn log_error_and_exit(error: anyhow::Error) -> ! {
    tracing::error!("{error:?}");
    eprintln!("{error:?}");
    std::process::exit(1);
}
