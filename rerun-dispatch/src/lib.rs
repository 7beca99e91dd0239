//! Lazy resolution of guest functions and the dispatch loops that drive translated code.

pub mod dispatch;
mod resolver;

#[cfg(test)]
mod tests;

pub use crate::{
    dispatch::generic::{lookup_or_resolve, rerun_dispatch_generic},
    resolver::{rerun_resolve, try_resolve, ResolveError},
};

use rerun_cpu::{GlobalState, RuntimeConfig};
use rerun_mem::{ArenaResult, Memory};
use rerun_rtld::{FunctionStore, Linker, ObjectLinker};

/// Reserve the arenas described by `config` and create a runtime that loads function objects from
/// `store` using the calling convention selected by `config`.
pub fn new_runtime(config: &RuntimeConfig, store: FunctionStore) -> ArenaResult<Box<GlobalState>> {
    let memory = Memory::init(config.mem_base, config.data_size, config.code_size)?;
    tracing::debug!("data arena: {:?}, code arena: {:?}", memory.data, memory.code);

    let info = dispatch::get(config.dispatch);
    tracing::debug!("dispatcher: {info:?}");

    let mut linker = ObjectLinker::new(&info);
    for (name, addr) in dispatch::runtime_symbols(config.dispatch) {
        linker.define_symbol(name, addr as u64);
    }

    Ok(GlobalState::new(Box::new(linker), store, memory, info))
}
